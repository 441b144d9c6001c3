//! Configuration file support for mbflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (MBFLASH_*)
//! 3. Local config file (./mbflash.toml)
//! 4. Global config file (~/.config/mbflash/config.toml)

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the per-project config file.
pub const LOCAL_CONFIG_FILE: &str = "mbflash.toml";

/// Which USB device to treat as the micro:bit.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceConfig {
    /// USB vendor ID.
    pub vendor_id: Option<u16>,
    /// USB product ID.
    pub product_id: Option<u16>,
}

/// Serial link settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SerialSettings {
    /// REPL baud rate.
    pub baud: Option<u32>,
}

/// Image building settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Default firmware template.
    pub firmware: Option<PathBuf>,
    /// Default output directory.
    pub output_dir: Option<PathBuf>,
    /// Flash address of the script region.
    pub start_address: Option<u32>,
    /// Size of the script region in bytes.
    pub capacity: Option<usize>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Device identity.
    #[serde(default)]
    pub device: DeviceConfig,
    /// Serial settings.
    #[serde(default)]
    pub serial: SerialSettings,
    /// Image settings.
    #[serde(default)]
    pub flash: FlashConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match Self::parse(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!(
                        "Failed to parse config file {} as TOML: {}",
                        path.display(),
                        e
                    );
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "mbflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; set values in `other` win.
    fn merge(&mut self, other: Self) {
        if other.device.vendor_id.is_some() {
            self.device.vendor_id = other.device.vendor_id;
        }
        if other.device.product_id.is_some() {
            self.device.product_id = other.device.product_id;
        }

        if other.serial.baud.is_some() {
            self.serial.baud = other.serial.baud;
        }

        if other.flash.firmware.is_some() {
            self.flash.firmware = other.flash.firmware;
        }
        if other.flash.output_dir.is_some() {
            self.flash.output_dir = other.flash.output_dir;
        }
        if other.flash.start_address.is_some() {
            self.flash.start_address = other.flash.start_address;
        }
        if other.flash.capacity.is_some() {
            self.flash.capacity = other.flash.capacity;
        }
    }
}
