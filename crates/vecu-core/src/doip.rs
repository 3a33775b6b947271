//! DoIP transport framing.
//!
//! A frame is an 8-octet header followed by `payload_length` octets of
//! payload. All multi-octet header fields are big-endian:
//!
//! ```text
//! Byte 0:   protocol version (0x02)
//! Byte 1:   inverse protocol version (0xFD, bitwise NOT of byte 0)
//! Byte 2-3: payload type
//! Byte 4-7: payload length
//! ```
//!
//! The reader and writer are generic over [`AsyncRead`]/[`AsyncWrite`] so
//! unit tests can drive them over `tokio::io::duplex` instead of a real
//! socket.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

/// DoIP protocol version emitted and expected by this implementation.
pub const PROTOCOL_VERSION: u8 = 0x02;
/// Bitwise NOT of [`PROTOCOL_VERSION`].
pub const INVERSE_PROTOCOL_VERSION: u8 = !PROTOCOL_VERSION;
/// Size of the fixed frame header in octets.
pub const HEADER_LEN: usize = 8;

/// Upper bound on a single frame payload. Firmware transfers arrive in
/// 4 KiB blocks, so anything near this limit is a corrupt or hostile
/// length field rather than a legitimate message.
pub const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

/// Vehicle identification number returned in the vehicle announcement.
pub const VIN: &[u8; 16] = b"VECU-SIM-1234567";

/// DoIP payload types used by the simulator.
pub mod payload_type {
    /// Vehicle identification request (no payload).
    pub const VEHICLE_IDENTIFICATION_REQUEST: u16 = 0x0004;
    /// Vehicle announcement carrying the VIN.
    pub const VEHICLE_ANNOUNCEMENT: u16 = 0x0005;
    /// Diagnostic (UDS) message; payload begins with the service ID.
    pub const DIAGNOSTIC_MESSAGE: u16 = 0x8001;
    /// Generic negative response (empty payload).
    pub const NEGATIVE_ACK: u16 = 0x8002;
}

/// Errors raised by the frame codec.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error on DoIP stream: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection after part of a frame was read.
    /// A close on a frame boundary is not an error; [`read_frame`]
    /// reports it as `Ok(None)`.
    #[error("connection closed mid-frame while reading {0}")]
    Truncated(&'static str),

    #[error("frame payload length {0} exceeds limit of {MAX_PAYLOAD_LEN} bytes")]
    PayloadTooLarge(u32),
}

/// The fixed DoIP frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoipHeader {
    pub protocol_version: u8,
    pub inverse_protocol_version: u8,
    pub payload_type: u16,
    pub payload_length: u32,
}

impl DoipHeader {
    /// Build a header for an outgoing frame.
    pub fn new(payload_type: u16, payload_length: u32) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            inverse_protocol_version: INVERSE_PROTOCOL_VERSION,
            payload_type,
            payload_length,
        }
    }

    /// Parse a header from raw wire bytes (big-endian).
    pub fn from_bytes(raw: &[u8; HEADER_LEN]) -> Self {
        Self {
            protocol_version: raw[0],
            inverse_protocol_version: raw[1],
            payload_type: u16::from_be_bytes([raw[2], raw[3]]),
            payload_length: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
        }
    }

    /// Serialize to wire bytes (big-endian).
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.protocol_version;
        buf[1] = self.inverse_protocol_version;
        buf[2..4].copy_from_slice(&self.payload_type.to_be_bytes());
        buf[4..8].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }

    /// Whether the inverse-version octet is the bitwise NOT of the
    /// version octet.
    pub fn version_consistent(&self) -> bool {
        self.inverse_protocol_version == !self.protocol_version
    }
}

/// A complete received frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload_type: u16,
    pub payload: Vec<u8>,
}

/// Read one frame from the stream.
///
/// Returns `Ok(None)` when the peer closes the connection cleanly on a
/// frame boundary. A close after the first header byte is a
/// [`FrameError::Truncated`] protocol error.
///
/// A header whose inverse-version octet does not match is logged and
/// accepted; tolerating the mismatch keeps us interoperable with testers
/// that never set the inverse octet.
pub async fn read_frame<R>(stream: &mut R) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = stream.read(&mut raw[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::Truncated("header"));
        }
        filled += n;
    }

    let header = DoipHeader::from_bytes(&raw);
    if !header.version_consistent() {
        warn!(
            version = format!("0x{:02X}", header.protocol_version),
            inverse = format!("0x{:02X}", header.inverse_protocol_version),
            "DoIP header version/inverse mismatch, accepting frame anyway"
        );
    }
    if header.payload_length > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge(header.payload_length));
    }

    let mut payload = vec![0u8; header.payload_length as usize];
    if !payload.is_empty() {
        stream.read_exact(&mut payload).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                FrameError::Truncated("payload")
            } else {
                FrameError::Io(e)
            }
        })?;
    }

    Ok(Some(Frame {
        payload_type: header.payload_type,
        payload,
    }))
}

/// Write one frame to the stream.
///
/// Header and payload are gathered into a single buffer so the frame
/// goes out in one write.
pub async fn write_frame<W>(
    stream: &mut W,
    payload_type: u16,
    payload: &[u8],
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let header = DoipHeader::new(payload_type, payload.len() as u32);
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(payload);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = DoipHeader::new(payload_type::DIAGNOSTIC_MESSAGE, 3);
        let parsed = DoipHeader::from_bytes(&header.to_bytes());
        assert_eq!(parsed, header);
        assert!(parsed.version_consistent());
    }

    #[test]
    fn header_wire_layout_is_big_endian() {
        let header = DoipHeader::new(0x8001, 0x0102_0304);
        assert_eq!(
            header.to_bytes(),
            [0x02, 0xFD, 0x80, 0x01, 0x01, 0x02, 0x03, 0x04]
        );
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(256);
        write_frame(&mut client, 0x8001, &[0x22, 0xF1, 0x01])
            .await
            .unwrap();

        let frame = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(frame.payload_type, 0x8001);
        assert_eq!(frame.payload, vec![0x22, 0xF1, 0x01]);
    }

    #[tokio::test]
    async fn empty_payload_is_valid() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_frame(&mut client, payload_type::VEHICLE_IDENTIFICATION_REQUEST, &[])
            .await
            .unwrap();

        let frame = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(
            frame.payload_type,
            payload_type::VEHICLE_IDENTIFICATION_REQUEST
        );
        assert!(frame.payload.is_empty());
    }

    #[tokio::test]
    async fn clean_eof_before_header_is_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_header_is_truncated() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0x02, 0xFD, 0x80]).await.unwrap();
        drop(client);

        match read_frame(&mut server).await {
            Err(FrameError::Truncated("header")) => {}
            other => panic!("expected truncated header, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn eof_mid_payload_is_truncated() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let header = DoipHeader::new(0x8001, 4);
        client.write_all(&header.to_bytes()).await.unwrap();
        client.write_all(&[0x22]).await.unwrap();
        drop(client);

        match read_frame(&mut server).await {
            Err(FrameError::Truncated("payload")) => {}
            other => panic!("expected truncated payload, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn inverse_mismatch_is_accepted() {
        let (mut client, mut server) = tokio::io::duplex(64);
        // Inverse octet left at 0x00; some testers never set it.
        client
            .write_all(&[0x02, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00])
            .await
            .unwrap();

        let frame = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(
            frame.payload_type,
            payload_type::VEHICLE_IDENTIFICATION_REQUEST
        );
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let header = DoipHeader::new(0x8001, MAX_PAYLOAD_LEN + 1);
        client.write_all(&header.to_bytes()).await.unwrap();

        assert!(matches!(
            read_frame(&mut server).await,
            Err(FrameError::PayloadTooLarge(_))
        ));
    }
}
