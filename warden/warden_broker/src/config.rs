//! Configuration for the warden broker
//!
//! Handles loading and validating broker configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

use warden_core::wire::DEFAULT_MAX_FRAME_BYTES;

/// Default socket filename.
const SOCKET_FILENAME: &str = "broker.sock";

/// Default subdirectory under the runtime directory.
const DEFAULT_SUBDIR: &str = "warden";

/// Errors that can occur in configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Default socket path based on environment.
///
/// Priority:
/// 1. `XDG_RUNTIME_DIR/warden/broker.sock` if `XDG_RUNTIME_DIR` is set
/// 2. `/tmp/warden/broker.sock` as fallback
pub fn default_socket_path() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR").map_or_else(
        |_| PathBuf::from("/tmp").join(DEFAULT_SUBDIR).join(SOCKET_FILENAME),
        |runtime_dir| PathBuf::from(runtime_dir).join(DEFAULT_SUBDIR).join(SOCKET_FILENAME),
    )
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

fn default_max_connections() -> usize {
    64
}

fn default_drain_timeout() -> u64 {
    10
}

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Path of the Unix socket the broker listens on
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Maximum size of a single wire frame
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Maximum concurrent caller connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Shutdown drain timeout (seconds)
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Peer uids allowed to connect in addition to the broker's own uid
    #[serde(default)]
    pub allowed_uids: Vec<u32>,

    /// Additional configuration
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            max_frame_bytes: default_max_frame_bytes(),
            max_connections: default_max_connections(),
            drain_timeout_secs: default_drain_timeout(),
            allowed_uids: Vec::new(),
            extra: HashMap::new(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from a file
    pub async fn load(path: Option<&str>) -> Result<Self> {
        // Start with default configuration
        let mut config = BrokerConfig::default();

        if let Some(path) = path {
            info!("Loading configuration from {}", path);

            if !Path::new(path).exists() {
                warn!("Configuration file not found: {}", path);
                return Ok(config);
            }

            let content = fs::read_to_string(path)
                .await
                .context(format!("Failed to read configuration file: {}", path))?;

            config = serde_json::from_str(&content)
                .context(format!("Failed to parse configuration file: {}", path))?;
        } else {
            info!("No configuration file specified, using defaults");
        }

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("Socket path cannot be empty".to_string()).into());
        }

        if self.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid("Max frame size cannot be zero".to_string()).into());
        }

        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("Max connections cannot be zero".to_string()).into());
        }

        if self.drain_timeout_secs == 0 {
            return Err(ConfigError::Invalid("Drain timeout cannot be zero".to_string()).into());
        }

        Ok(())
    }

    /// Merge with another configuration
    pub fn merge(&mut self, other: BrokerConfig) {
        if !other.socket_path.as_os_str().is_empty() {
            self.socket_path = other.socket_path;
        }

        if other.max_frame_bytes > 0 {
            self.max_frame_bytes = other.max_frame_bytes;
        }

        if other.max_connections > 0 {
            self.max_connections = other.max_connections;
        }

        if other.drain_timeout_secs > 0 {
            self.drain_timeout_secs = other.drain_timeout_secs;
        }

        for uid in other.allowed_uids {
            if !self.allowed_uids.contains(&uid) {
                self.allowed_uids.push(uid);
            }
        }

        for (key, value) in other.extra {
            self.extra.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_load_config() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();

        let config_json = r#"
        {
            "socket_path": "/run/warden/broker.sock",
            "max_connections": 8,
            "drain_timeout_secs": 3,
            "allowed_uids": [1000]
        }
        "#;

        fs::write(path, config_json).await.unwrap();

        let config = BrokerConfig::load(Some(path)).await.unwrap();

        assert_eq!(config.socket_path, PathBuf::from("/run/warden/broker.sock"));
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.drain_timeout_secs, 3);
        assert_eq!(config.allowed_uids, vec![1000]);
        // Unspecified fields fall back to defaults.
        assert_eq!(config.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
    }

    #[tokio::test]
    async fn test_default_config() {
        let config = BrokerConfig::load(None).await.unwrap();

        assert!(config.socket_path.ends_with("warden/broker.sock"));
        assert_eq!(config.max_connections, 64);
        assert_eq!(config.drain_timeout_secs, 10);
        assert!(config.allowed_uids.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();

        fs::write(path, r#"{ "max_connections": 0 }"#).await.unwrap();

        let result = BrokerConfig::load(Some(path)).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_merge_config() {
        let mut base = BrokerConfig::default();

        let mut override_config = BrokerConfig::default();
        override_config.socket_path = PathBuf::from("/override/broker.sock");
        override_config.drain_timeout_secs = 60;
        override_config.allowed_uids = vec![4242];

        base.merge(override_config);

        assert_eq!(base.socket_path, PathBuf::from("/override/broker.sock"));
        assert_eq!(base.drain_timeout_secs, 60);
        assert_eq!(base.allowed_uids, vec![4242]);
    }
}
