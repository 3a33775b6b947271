//! Simulator configuration.
//!
//! Everything has a default, so the simulator runs with no config file
//! at all; a TOML file (and a few CLI flags on top) can override any
//! field.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default DoIP TCP port.
pub const DEFAULT_PORT: u16 = 13400;

/// Platform name of the loadable application module, resolved at build
/// time the same way the dynamic loader expects it.
#[cfg(target_vendor = "apple")]
pub const APP_MODULE_PATH: &str = "./libacc_app.dylib";
#[cfg(not(target_vendor = "apple"))]
pub const APP_MODULE_PATH: &str = "./libacc_app.so";

/// Complete simulator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcuConfig {
    /// TCP port the DoIP server listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Backing file of the NVRAM store.
    #[serde(default = "default_nvram_file")]
    pub nvram_file: PathBuf,

    /// Path of the loadable application module.
    #[serde(default = "default_app_module")]
    pub app_module: PathBuf,

    /// Scratch file firmware is streamed into during an OTA transfer.
    #[serde(default = "default_update_scratch")]
    pub update_scratch: PathBuf,

    /// Seconds between lifecycle-loop cycles.
    #[serde(default = "default_cycle_seconds")]
    pub cycle_seconds: u64,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_nvram_file() -> PathBuf {
    PathBuf::from("nvram.dat")
}

fn default_app_module() -> PathBuf {
    PathBuf::from(APP_MODULE_PATH)
}

fn default_update_scratch() -> PathBuf {
    PathBuf::from("update.bin")
}

fn default_cycle_seconds() -> u64 {
    2
}

impl Default for EcuConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            nvram_file: default_nvram_file(),
            app_module: default_app_module(),
            update_scratch: default_update_scratch(),
            cycle_seconds: default_cycle_seconds(),
        }
    }
}

impl EcuConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_is_all_defaults() {
        let config: EcuConfig = toml::from_str("").unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.nvram_file, PathBuf::from("nvram.dat"));
        assert_eq!(config.cycle_seconds, 2);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let config: EcuConfig = toml::from_str(
            r#"
port = 23400
nvram_file = "/tmp/test-nvram.dat"
"#,
        )
        .unwrap();
        assert_eq!(config.port, 23400);
        assert_eq!(config.nvram_file, PathBuf::from("/tmp/test-nvram.dat"));
        assert_eq!(config.update_scratch, PathBuf::from("update.bin"));
    }
}
