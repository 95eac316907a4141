//! Overlay configuration
//!
//! Recognised options for a node, loaded from a JSON file and validated
//! before anything is started.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default port for peer-to-peer connections
pub const DEFAULT_PORT: u16 = 22200;

/// Default data directory
pub const DEFAULT_DATA_DIR: &str = ".overlay_data";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Heartbeat timeout ({timeout_ms}ms) must be greater than heartbeat interval ({interval_ms}ms)")]
    HeartbeatTimeout { interval_ms: u64, timeout_ms: u64 },
    #[error("Invalid port: 0")]
    InvalidPort,
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
    #[error("Invalid bootstrap peer '{0}' (expected host:port)")]
    InvalidBootstrapPeer(String),
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Whether the overlay runs at all
    pub enabled: bool,
    /// Port to listen on
    pub port: u16,
    /// Host other peers should use to reach this node
    pub advertise_host: String,
    /// Display name announced in handshakes
    pub name: String,
    /// How often heartbeats are sent and checked
    pub heartbeat_interval_ms: u64,
    /// Silence after which a peer is force-disconnected
    pub heartbeat_timeout_ms: u64,
    /// How often connected peers are asked for their directory
    pub discovery_interval_ms: u64,
    /// How often the connection pool is reconciled with the registry
    pub reconciliation_interval_ms: u64,
    /// How often every connected peer gets a full anti-entropy round
    pub sync_interval_ms: u64,
    /// Initial peers to connect to (`host:port`)
    pub bootstrap_peers: Vec<String>,
    /// Bound on handshakes and request/response round trips
    pub client_timeout_ms: u64,
    /// Bound on a single frame write
    pub write_timeout_ms: u64,
    /// Worker threads for the async runtime
    pub pool_threads: usize,
    /// Connection attempts per `connect` call
    pub retry_attempts: u32,
    /// Pause between connection attempts
    pub retry_delay_ms: u64,
    /// Pause between entity fetch and attachment transfer
    pub attachment_delay_ms: u64,
    /// Directory for the peer registry and attachments
    pub data_dir: PathBuf,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: DEFAULT_PORT,
            advertise_host: "127.0.0.1".to_string(),
            name: "overlay-node".to_string(),
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            discovery_interval_ms: 60_000,
            reconciliation_interval_ms: 60_000,
            sync_interval_ms: 60_000,
            bootstrap_peers: Vec::new(),
            client_timeout_ms: 10_000,
            write_timeout_ms: 5_000,
            pool_threads: 4,
            retry_attempts: 3,
            retry_delay_ms: 1_000,
            attachment_delay_ms: 2_000,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
        }
    }
}

impl OverlayConfig {
    /// Load a configuration file and validate it
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: OverlayConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants every component relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        let non_zero = [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("heartbeat_timeout_ms", self.heartbeat_timeout_ms),
            ("discovery_interval_ms", self.discovery_interval_ms),
            ("reconciliation_interval_ms", self.reconciliation_interval_ms),
            ("sync_interval_ms", self.sync_interval_ms),
            ("client_timeout_ms", self.client_timeout_ms),
            ("write_timeout_ms", self.write_timeout_ms),
            ("pool_threads", self.pool_threads as u64),
            ("retry_attempts", u64::from(self.retry_attempts)),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::ZeroValue(name));
            }
        }

        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::HeartbeatTimeout {
                interval_ms: self.heartbeat_interval_ms,
                timeout_ms: self.heartbeat_timeout_ms,
            });
        }

        for peer in &self.bootstrap_peers {
            parse_host_port(peer)?;
        }

        Ok(())
    }

    /// Parsed bootstrap peers
    pub fn bootstrap_addresses(&self) -> Result<Vec<(String, u16)>, ConfigError> {
        self.bootstrap_peers
            .iter()
            .map(|p| parse_host_port(p))
            .collect()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Reconnection sweeps run at twice the heartbeat interval
    pub fn reconnect_interval(&self) -> Duration {
        self.heartbeat_interval() * 2
    }

    pub fn reconciliation_interval(&self) -> Duration {
        Duration::from_millis(self.reconciliation_interval_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn attachment_delay(&self) -> Duration {
        Duration::from_millis(self.attachment_delay_ms)
    }
}

/// Split `host:port`, rejecting empty hosts and port 0
pub fn parse_host_port(value: &str) -> Result<(String, u16), ConfigError> {
    let invalid = || ConfigError::InvalidBootstrapPeer(value.to_string());

    let (host, port) = value.trim().rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim();
    let port: u16 = port.trim().parse().map_err(|_| invalid())?;

    if host.is_empty() || port == 0 {
        return Err(invalid());
    }

    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = OverlayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reconnect_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_timeout_must_exceed_interval() {
        let mut config = OverlayConfig {
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 30_000,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::HeartbeatTimeout { .. })
        ));

        config.heartbeat_timeout_ms = 10_000;
        assert!(config.validate().is_err());

        config.heartbeat_timeout_ms = 30_001;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_values() {
        let config = OverlayConfig {
            pool_threads: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroValue("pool_threads"))
        ));

        let config = OverlayConfig {
            port: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPort)));
    }

    #[test]
    fn test_bootstrap_parsing() {
        assert_eq!(
            parse_host_port("10.0.0.5:22200").unwrap(),
            ("10.0.0.5".to_string(), 22200)
        );
        assert!(parse_host_port("nohost").is_err());
        assert!(parse_host_port(":22200").is_err());
        assert!(parse_host_port("host:0").is_err());
        assert!(parse_host_port("host:abc").is_err());

        let config = OverlayConfig {
            bootstrap_peers: vec!["a:1".into(), "broken".into()],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBootstrapPeer(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overlay.json");
        std::fs::write(
            &path,
            r#"{"port": 23000, "name": "alpha", "heartbeat_interval_ms": 1000, "heartbeat_timeout_ms": 3000}"#,
        )
        .unwrap();

        let config = OverlayConfig::load(&path).unwrap();
        assert_eq!(config.port, 23000);
        assert_eq!(config.name, "alpha");
        assert_eq!(config.retry_attempts, 3);

        std::fs::write(&path, r#"{"heartbeat_interval_ms": 5000, "heartbeat_timeout_ms": 1000}"#)
            .unwrap();
        assert!(OverlayConfig::load(&path).is_err());
    }
}
