//! Subsystem configuration
//!
//! Multicast group/port and TCP port are fixed at configuration time;
//! defaults match the values the protocol has always shipped with.

use std::net::Ipv4Addr;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Default multicast group for discovery
pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(228, 5, 6, 7);

/// Default UDP port for discovery datagrams
pub const DEFAULT_MULTICAST_PORT: u16 = 6789;

/// Default TCP port for the session listener
pub const DEFAULT_TCP_PORT: u16 = 6761;

/// Default interval between discovery advertisements
pub const DEFAULT_ANNOUNCE_INTERVAL_MS: u64 = 2000;

/// Configuration for the discovery-and-session subsystem
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Multicast group advertisements are sent to
    pub multicast_group: Ipv4Addr,
    /// UDP port for discovery
    pub multicast_port: u16,
    /// TCP port the server listens on (0 = ephemeral)
    pub tcp_port: u16,
    /// Interval between advertisements in milliseconds
    pub announce_interval_ms: u64,
    /// Identifier sent in the client handshake; generated when absent
    pub client_id: Option<String>,
    /// Identifier advertised by the server; generated when absent
    pub master_id: Option<String>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            multicast_group: DEFAULT_MULTICAST_GROUP,
            multicast_port: DEFAULT_MULTICAST_PORT,
            tcp_port: DEFAULT_TCP_PORT,
            announce_interval_ms: DEFAULT_ANNOUNCE_INTERVAL_MS,
            client_id: None,
            master_id: None,
        }
    }
}

impl LinkConfig {
    /// Parse from TOML text
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LinkConfig::default();
        assert_eq!(config.multicast_group, DEFAULT_MULTICAST_GROUP);
        assert_eq!(config.multicast_port, DEFAULT_MULTICAST_PORT);
        assert_eq!(config.tcp_port, DEFAULT_TCP_PORT);
        assert!(config.client_id.is_none());
    }

    #[test]
    fn test_parse_toml() {
        let config = LinkConfig::from_toml_str(
            r#"
            multicast_group = "239.9.9.1"
            multicast_port = 5761
            tcp_port = 0
            client_id = "phone-1"
            "#,
        )
        .unwrap();

        assert_eq!(config.multicast_group, Ipv4Addr::new(239, 9, 9, 1));
        assert_eq!(config.multicast_port, 5761);
        assert_eq!(config.tcp_port, 0);
        assert_eq!(config.client_id.as_deref(), Some("phone-1"));
        // Unspecified fields keep their defaults
        assert_eq!(config.announce_interval_ms, DEFAULT_ANNOUNCE_INTERVAL_MS);
    }

    #[test]
    fn test_parse_toml_invalid() {
        assert!(LinkConfig::from_toml_str("multicast_port = \"nope\"").is_err());
    }
}
