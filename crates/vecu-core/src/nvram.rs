//! Simulated NVRAM: a file-backed key-value store.
//!
//! The ECU persists its configuration the way real ECUs keep calibration
//! data in flash: one `key=value` line per entry. The diagnostic session
//! handler and the cruise-control application both go through this store,
//! so every operation takes the single mutex for its full duration.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

/// Errors surfaced by NVRAM operations. Only I/O can fail; malformed
/// content is skipped, not rejected.
#[derive(Debug, Error)]
pub enum NvramError {
    #[error("NVRAM I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type NvramResult<T> = Result<T, NvramError>;

/// File-backed key-value store with a single mutex over the in-memory map.
///
/// Keys are stored in a `BTreeMap`, so [`save`](NvramStore::save) writes
/// entries in sorted order and produces deterministic files.
pub struct NvramStore {
    path: PathBuf,
    data: Mutex<BTreeMap<String, String>>,
}

impl NvramStore {
    /// Bind a store to a backing file. No I/O happens until
    /// [`load`](NvramStore::load) or [`save`](NvramStore::save).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            data: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the store from disk, replacing the in-memory contents.
    ///
    /// A missing backing file is not an error: the factory defaults are
    /// installed and written out. Lines without a `=` are skipped; the
    /// first `=` on a line separates key from value, so values may
    /// themselves contain `=`. Duplicate keys collapse last-write-wins.
    pub fn load(&self) -> NvramResult<()> {
        let mut data = self.data.lock();

        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no NVRAM file found, creating defaults");
                *data = factory_defaults();
                return self.write_locked(&data);
            }
            Err(source) => {
                return Err(NvramError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        data.clear();
        for line in content.lines() {
            match line.split_once('=') {
                Some((key, value)) => {
                    data.insert(key.to_string(), value.to_string());
                }
                None => {
                    if !line.is_empty() {
                        debug!(line, "skipping malformed NVRAM line");
                    }
                }
            }
        }
        Ok(())
    }

    /// Truncate the backing file and write every entry as `key=value\n`.
    pub fn save(&self) -> NvramResult<()> {
        let data = self.data.lock();
        self.write_locked(&data)
    }

    /// Look up a value. Returns an owned copy so the lock is not held
    /// across the caller's use of it.
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.lock().get(key).cloned()
    }

    /// Insert or overwrite a value. In-memory only; call
    /// [`save`](NvramStore::save) to persist.
    pub fn set(&self, key: &str, value: &str) {
        self.data.lock().insert(key.to_string(), value.to_string());
    }

    /// Convenience: `get` parsed as `f64`, with a fallback for absent or
    /// unparseable values. The application reads all of its calibration
    /// through this.
    pub fn get_f64_or(&self, key: &str, default: f64) -> f64 {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn write_locked(&self, data: &BTreeMap<String, String>) -> NvramResult<()> {
        let io_err = |source| NvramError::Io {
            path: self.path.clone(),
            source,
        };

        let mut file = fs::File::create(&self.path).map_err(io_err)?;
        for (key, value) in data {
            writeln!(file, "{key}={value}").map_err(io_err)?;
        }
        Ok(())
    }
}

/// Contents installed when no NVRAM file exists yet.
fn factory_defaults() -> BTreeMap<String, String> {
    [
        ("FIRMWARE_VERSION", "3.0.0"),
        ("ECU_SERIAL_NUMBER", "VECU-2025-001"),
        ("LEAD_VEHICLE_SPEED", "65.0"),
        ("OWN_VEHICLE_SPEED", "65.0"),
        ("ACC_GAP_SETTING", "3"),
        ("ACC_KP", "0.4"),
        ("ACC_KI", "0.1"),
        ("ACC_MAX_ACCEL", "2.0"),
        ("ACC_MAX_DECEL", "3.0"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}
