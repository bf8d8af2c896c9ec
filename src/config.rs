//! Configuration
//!
//! TOML-backed daemon configuration with a `MIRRORSYNC_KEY` environment
//! override for the shared encryption key. Validation runs at load time
//! and is fatal; a misconfigured node must not start.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::protocol::KEY_LEN;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Node role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Slave,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Slave => write!(f, "slave"),
        }
    }
}

/// A directory the master watches, with its replication targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorPath {
    pub path: String,
    /// Slave addresses as `host:port`.
    pub slaves: Vec<String>,
}

/// HTTP upload panel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default)]
    pub enabled: bool,
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub upload_dir: String,
}

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node_id: String,
    pub role: Role,
    /// Shared AES-256 key, exactly 32 bytes. Overridable via the
    /// `MIRRORSYNC_KEY` environment variable.
    pub key: String,
    pub port: u16,

    /// Master only: directories to watch and their targets.
    #[serde(default)]
    pub monitor_paths: Vec<MonitorPath>,

    /// Slave only: master address as `host:port`.
    #[serde(default)]
    pub master_addr: String,
    /// Slave only: local root where replicated files land.
    #[serde(default)]
    pub sync_path: String,

    #[serde(default)]
    pub web: Option<WebConfig>,

    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default)]
    pub debug: bool,
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_debounce_ms() -> u64 {
    5000
}

impl Config {
    /// Load, apply environment overrides, and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let mut config: Config = toml::from_str(&raw)?;

        if let Ok(key) = std::env::var("MIRRORSYNC_KEY") {
            if !key.is_empty() {
                config.key = key;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field rules. Called by `load`; exposed for tests and
    /// programmatic construction.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.is_empty() {
            return Err(ConfigError::Invalid("node_id is required".to_string()));
        }

        if self.key.len() != KEY_LEN {
            return Err(ConfigError::Invalid(format!(
                "key must be exactly {} bytes, got {}",
                KEY_LEN,
                self.key.len()
            )));
        }

        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be non-zero".to_string()));
        }

        match self.role {
            Role::Master => {
                if self.monitor_paths.is_empty() {
                    return Err(ConfigError::Invalid(
                        "master requires at least one monitor path".to_string(),
                    ));
                }
                for mp in &self.monitor_paths {
                    if mp.path.is_empty() {
                        return Err(ConfigError::Invalid(
                            "monitor path must not be empty".to_string(),
                        ));
                    }
                }
            }
            Role::Slave => {
                if self.master_addr.is_empty() {
                    return Err(ConfigError::Invalid(
                        "slave requires master_addr".to_string(),
                    ));
                }
                if self.sync_path.is_empty() {
                    return Err(ConfigError::Invalid("slave requires sync_path".to_string()));
                }
            }
        }

        Ok(())
    }

    /// The shared key as the fixed-size array the codec expects.
    pub fn key_bytes(&self) -> [u8; KEY_LEN] {
        let mut out = [0u8; KEY_LEN];
        out.copy_from_slice(self.key.as_bytes());
        out
    }
}
