//! Firmware integrity digests.
//!
//! The OTA flow identifies firmware by content hash only: the tester
//! sends the lowercase-hex SHA-256 of the file it transferred, and the
//! ECU recomputes the digest over the received scratch file before
//! swapping it in.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

/// SHA-256 of a byte slice, rendered as 64 lowercase hex characters.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Streaming SHA-256 of a file, rendered as 64 lowercase hex characters.
pub fn sha256_hex_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        // SHA-256 of the empty input.
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn file_digest_matches_slice_digest() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("fw.bin");
        let payload = b"hello world 1234";
        std::fs::write(&path, payload).unwrap();

        assert_eq!(sha256_hex_file(&path).unwrap(), sha256_hex(payload));
    }
}
