//! Network configuration for a Parley node.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the Parley networking layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the advertiser binds its TCP listener to. Port 0 picks an
    /// ephemeral port, which is then carried in the discovery record.
    #[serde(with = "socket_addr_serde")]
    pub listen_addr: SocketAddr,

    /// UDP port the browser listens on for discovery records.
    pub discovery_port: u16,

    /// Where discovery records are sent. Empty means the limited broadcast
    /// address on `discovery_port`.
    #[serde(with = "socket_addr_vec_serde")]
    pub announce_addrs: Vec<SocketAddr>,

    /// Interval between re-announcements of an active record.
    #[serde(with = "duration_serde")]
    pub announce_interval: Duration,

    /// Upper bound on resolving a discovered record to an address.
    #[serde(with = "duration_serde")]
    pub resolve_timeout: Duration,

    /// Upper bound on establishing an outbound connection.
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Host name placed in our discovery record. Peers resolve it instead of
    /// using the datagram's source address.
    pub advertise_host: Option<String>,

    /// Largest frame accepted from a peer before the connection is dropped.
    pub max_frame_len: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            discovery_port: 9471,
            announce_addrs: Vec::new(),
            announce_interval: Duration::from_secs(2),
            resolve_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            advertise_host: None,
            max_frame_len: 1024 * 1024,
        }
    }
}

/// Shortest re-announce period the advertiser will run with.
pub const MIN_ANNOUNCE_INTERVAL: Duration = Duration::from_millis(10);

impl NetworkConfig {
    /// Replace zero durations, which would stall or panic the background
    /// tasks, with their defaults.
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        for (name, value, default) in [
            (
                "announce_interval",
                &mut self.announce_interval,
                defaults.announce_interval,
            ),
            (
                "resolve_timeout",
                &mut self.resolve_timeout,
                defaults.resolve_timeout,
            ),
            (
                "connect_timeout",
                &mut self.connect_timeout,
                defaults.connect_timeout,
            ),
        ] {
            if value.is_zero() {
                tracing::warn!("{name} of 0 is not usable, using {}s", default.as_secs());
                *value = default;
            }
        }
        self
    }

    /// The addresses discovery records are sent to.
    pub fn announce_targets(&self) -> Vec<SocketAddr> {
        if self.announce_addrs.is_empty() {
            vec![SocketAddr::from((Ipv4Addr::BROADCAST, self.discovery_port))]
        } else {
            self.announce_addrs.clone()
        }
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write config file: {e}"))
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<NetworkConfig>(&data) {
                    Ok(config) => return config.normalized(),
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(addr: &SocketAddr, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SocketAddr, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

mod socket_addr_vec_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(addrs: &[SocketAddr], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(addrs.iter().map(|a| a.to_string()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<SocketAddr>, D::Error> {
        let raw = Vec::<String>::deserialize(d)?;
        raw.iter()
            .map(|s| s.parse().map_err(serde::de::Error::custom))
            .collect()
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Whole seconds, rounded up so a short non-zero interval never
    /// becomes 0.
    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        let secs = dur.as_secs() + u64::from(dur.subsec_nanos() > 0);
        s.serialize_u64(secs)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NetworkConfig::default();
        assert_eq!(config.listen_addr.port(), 0);
        assert_eq!(config.discovery_port, 9471);
        assert!(config.announce_addrs.is_empty());
        assert_eq!(config.resolve_timeout, Duration::from_secs(30));
        assert!(config.advertise_host.is_none());
    }

    #[test]
    fn test_announce_targets_default_to_broadcast() {
        let config = NetworkConfig::default();
        let targets = config.announce_targets();
        assert_eq!(targets, vec!["255.255.255.255:9471".parse().unwrap()]);
    }

    #[test]
    fn test_announce_targets_explicit() {
        let config = NetworkConfig {
            announce_addrs: vec!["127.0.0.1:4000".parse().unwrap()],
            ..NetworkConfig::default()
        };
        assert_eq!(config.announce_targets().len(), 1);
        assert_eq!(config.announce_targets()[0].port(), 4000);
    }

    #[test]
    fn test_config_serialize_roundtrip() {
        let config = NetworkConfig {
            announce_addrs: vec!["10.0.0.7:9471".parse().unwrap()],
            advertise_host: Some("alice.local".into()),
            ..NetworkConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: NetworkConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.listen_addr, config.listen_addr);
        assert_eq!(deserialized.announce_addrs, config.announce_addrs);
        assert_eq!(deserialized.advertise_host.as_deref(), Some("alice.local"));
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: NetworkConfig = serde_json::from_str(r#"{"discovery_port": 5353}"#).unwrap();
        assert_eq!(config.discovery_port, 5353);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let original = NetworkConfig {
            discovery_port: 12000,
            announce_interval: Duration::from_secs(7),
            ..NetworkConfig::default()
        };
        original.save_to_file(&path).unwrap();

        let loaded = NetworkConfig::load_or_default(&path);
        assert_eq!(loaded.discovery_port, 12000);
        assert_eq!(loaded.announce_interval, Duration::from_secs(7));
    }

    #[test]
    fn test_zero_intervals_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"announce_interval": 0, "connect_timeout": 0, "resolve_timeout": 4}"#,
        )
        .unwrap();

        let config = NetworkConfig::load_or_default(&path);
        assert_eq!(config.announce_interval, Duration::from_secs(2));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.resolve_timeout, Duration::from_secs(4));
    }

    #[test]
    fn test_sub_second_interval_is_saved_as_one_second() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = NetworkConfig {
            announce_interval: Duration::from_millis(200),
            ..NetworkConfig::default()
        };
        config.save_to_file(&path).unwrap();

        let loaded = NetworkConfig::load_or_default(&path);
        assert_eq!(loaded.announce_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_config_load_corrupt_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();

        let config = NetworkConfig::load_or_default(&path);
        assert_eq!(config.discovery_port, 9471);
    }
}
