//! Configuration management for shrd.
//!
//! This module handles loading, saving, and validating shrd configuration.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/shrd/config.toml` |
//! | macOS | `~/Library/Application Support/shrd/config.toml` |
//! | Windows | `%APPDATA%\shrd\config\config.toml` |
//!
//! Identity and trust files live in the platform data directory.
//!
//! ## Example
//!
//! ```rust,ignore
//! use shrd_core::config::Config;
//!
//! let config = Config::load()?;
//! println!("Device name: {}", config.general.device_name);
//! ```

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Largest chunk size accepted in configuration and on the wire.
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Main configuration struct for shrd.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,
    /// Network settings
    pub network: NetworkConfig,
    /// Health monitor settings
    pub health: HealthConfig,
    /// Transfer settings
    pub transfer: TransferConfig,
}

/// General configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Display name on network
    pub device_name: String,
    /// Directory for received files
    pub download_dir: PathBuf,
    /// Accept every incoming transfer without asking
    pub auto_accept: bool,
    /// Directory paired devices may browse and download from; unset
    /// disables remote browsing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share_dir: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            download_dir: default_download_dir(),
            auto_accept: false,
            share_dir: None,
        }
    }
}

/// Network configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Transfer port (TCP)
    pub port: u16,
    /// Discovery port (UDP)
    pub discovery_port: u16,
    /// Address the transfer listener binds to
    pub bind_address: IpAddr,
    /// How often presence is announced
    #[serde(with = "humantime_serde")]
    pub announce_interval: Duration,
    /// Destination of presence announcements
    pub announce_address: IpAddr,
    /// Announce and listen for UDP presence beacons
    pub discovery: bool,
    /// Also announce and browse over mDNS
    pub mdns: bool,
    /// TCP connect timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Crypto handshake timeout
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: crate::DEFAULT_PORT,
            discovery_port: crate::DEFAULT_DISCOVERY_PORT,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announce_interval: Duration::from_secs(30),
            announce_address: IpAddr::V4(Ipv4Addr::BROADCAST),
            discovery: true,
            mdns: true,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Health monitor configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Time between probe rounds
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Failed probes in a row before a device goes offline
    pub max_consecutive_misses: u32,
    /// How long a non-trusted offline device is kept
    #[serde(with = "humantime_serde")]
    pub stale_retention: Duration,
    /// Probes allowed in flight at once
    pub max_concurrent_probes: usize,
    /// Timeout of a single probe
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_consecutive_misses: 3,
            stale_retention: Duration::from_secs(24 * 60 * 60),
            max_concurrent_probes: 8,
            probe_timeout: Duration::from_secs(3),
        }
    }
}

/// Transfer configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Chunk size in bytes
    pub chunk_size: usize,
    /// Concurrent sessions allowed per peer
    pub max_concurrent_per_peer: usize,
    /// Time allowed for the header exchange
    #[serde(with = "humantime_serde")]
    pub negotiate_timeout: Duration,
    /// Time allowed between the last chunk and the final verdict
    #[serde(with = "humantime_serde")]
    pub verify_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            max_concurrent_per_peer: 2,
            negotiate_timeout: Duration::from_secs(30),
            verify_timeout: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    ///
    /// Creates the configuration directory if it doesn't exist.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to a specific file.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!("Failed to create config directory: {e}"))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| Error::ConfigError(format!("Failed to write config: {e}")))
    }

    /// Check values that would make the node misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.transfer.chunk_size == 0 || self.transfer.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidConfig {
                key: "transfer.chunk_size".to_string(),
                reason: format!("must be between 1 and {MAX_CHUNK_SIZE}"),
            });
        }
        if self.transfer.max_concurrent_per_peer == 0 {
            return Err(Error::InvalidConfig {
                key: "transfer.max_concurrent_per_peer".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.health.max_concurrent_probes == 0 {
            return Err(Error::InvalidConfig {
                key: "health.max_concurrent_probes".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.health.max_consecutive_misses == 0 {
            return Err(Error::InvalidConfig {
                key: "health.max_consecutive_misses".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Get the default configuration directory path.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the full path to the configuration file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        Self::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }

    /// Directory holding the identity key and the trust store.
    #[must_use]
    pub fn data_dir() -> PathBuf {
        project_dirs().map_or_else(|| PathBuf::from("."), |dirs| dirs.data_dir().to_path_buf())
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", "shrd")
}

fn default_device_name() -> String {
    hostname::get().map_or_else(
        |_| "shrd device".to_string(),
        |h| h.to_string_lossy().to_string(),
    )
}

fn default_download_dir() -> PathBuf {
    directories::UserDirs::new()
        .and_then(|dirs| dirs.download_dir().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shrd")
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let secs = duration.as_secs();
        let text = if duration.subsec_millis() > 0 {
            format!("{}ms", duration.as_millis())
        } else if secs > 0 && secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs > 0 && secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{secs}s")
        };
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let (digits, unit) = s
            .find(|c: char| !c.is_ascii_digit())
            .map_or((s.as_str(), "s"), |idx| s.split_at(idx));
        let value: u64 = digits.parse().map_err(serde::de::Error::custom)?;
        match unit {
            "ms" => Ok(Duration::from_millis(value)),
            "s" => Ok(Duration::from_secs(value)),
            "m" => Ok(Duration::from_secs(value * 60)),
            "h" => Ok(Duration::from_secs(value * 3600)),
            _ => Err(serde::de::Error::custom("invalid duration format")),
        }
    }
}
