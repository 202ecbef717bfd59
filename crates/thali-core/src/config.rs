//! Configuration system for Thali.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $THALI_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/thali/config.toml
//!   3. ~/.config/thali/config.toml
//!
//! Every tunable the discovery and replication layers consume lives
//! here and is passed into the manager at start — tests construct their
//! own record instead of mutating globals.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThaliConfig {
    pub identity: IdentityConfig,
    pub peers: PeerConfig,
    pub ssdp: SsdpConfig,
    pub beacon: BeaconConfig,
    pub replication: ReplicationConfig,
    pub trust: TrustConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to the secp256k1 keypair. Auto-generated on first run.
    pub keypair_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Silence window after which a Wi-Fi peer is declared gone.
    pub tcp_peer_unavailability_threshold_ms: u64,
    /// Silence window after which a native (Bluetooth/MPCF) peer is
    /// declared gone. Native radios advertise far less often than SSDP.
    pub non_tcp_peer_unavailability_threshold_ms: u64,
    /// Quiescence after which a repeated Bluetooth generation is treated
    /// as a fresh advertisement cycle rather than a duplicate.
    pub update_windows_foreground_ms: u64,
    /// Suggested TCP connect timeout handed to replication for Wi-Fi peers.
    pub suggested_tcp_timeout_wifi_ms: u64,
    /// Suggested TCP connect timeout for native peers.
    pub suggested_tcp_timeout_native_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SsdpConfig {
    /// Interval between NOTIFY alive datagrams.
    pub advertisement_interval_ms: u64,
    /// UDP port the SSDP group is joined on. Tests use an ephemeral port.
    pub port: u16,
    /// SSDP multicast group.
    pub multicast_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BeaconConfig {
    /// Lifetime of a published beacon stream. The wire format caps
    /// expiration at one day; larger values are rejected at load.
    pub milliseconds_to_expire: u64,
    /// How long before expiry the stream is regenerated.
    pub refresh_margin_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Path prefix the document-store router mounts under.
    pub base_db_path: String,
    /// Prefix for per-peer `_local` sequence checkpoint documents.
    pub local_seq_point_prefix: String,
    /// Maximum concurrent outbound replication attempts.
    pub pool_max_concurrency: usize,
    /// TCP port for the replication router. 0 = OS-assigned; the SSDP
    /// LOCATION header advertises whatever was bound.
    pub api_port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Hex-encoded 65-byte uncompressed public keys this node is willing
    /// to exchange data with.
    pub authorized_peers: Vec<String>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            keypair_path: config_dir().join("keypair"),
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            // Six missed SSDP advertisement intervals
            tcp_peer_unavailability_threshold_ms: 3_000,
            non_tcp_peer_unavailability_threshold_ms: 30_000,
            update_windows_foreground_ms: 30_000,
            suggested_tcp_timeout_wifi_ms: 5_000,
            suggested_tcp_timeout_native_ms: 10_000,
        }
    }
}

impl Default for SsdpConfig {
    fn default() -> Self {
        Self {
            advertisement_interval_ms: 500,
            port: 1900,
            multicast_address: "239.255.255.250".to_string(),
        }
    }
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            milliseconds_to_expire: 3_600_000,
            refresh_margin_ms: 60_000,
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            base_db_path: "/db".to_string(),
            local_seq_point_prefix: "thali_".to_string(),
            pool_max_concurrency: 4,
            api_port: 0,
        }
    }
}

// ── Duration accessors ────────────────────────────────────────────────────────

impl PeerConfig {
    pub fn tcp_peer_unavailability_threshold(&self) -> Duration {
        Duration::from_millis(self.tcp_peer_unavailability_threshold_ms)
    }

    pub fn non_tcp_peer_unavailability_threshold(&self) -> Duration {
        Duration::from_millis(self.non_tcp_peer_unavailability_threshold_ms)
    }

    pub fn update_windows_foreground(&self) -> Duration {
        Duration::from_millis(self.update_windows_foreground_ms)
    }

    pub fn suggested_tcp_timeout_wifi(&self) -> Duration {
        Duration::from_millis(self.suggested_tcp_timeout_wifi_ms)
    }

    pub fn suggested_tcp_timeout_native(&self) -> Duration {
        Duration::from_millis(self.suggested_tcp_timeout_native_ms)
    }
}

impl SsdpConfig {
    pub fn advertisement_interval(&self) -> Duration {
        Duration::from_millis(self.advertisement_interval_ms)
    }
}

impl BeaconConfig {
    pub fn milliseconds_to_expire_duration(&self) -> Duration {
        Duration::from_millis(self.milliseconds_to_expire)
    }

    pub fn refresh_margin(&self) -> Duration {
        Duration::from_millis(self.refresh_margin_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_or_tmp().join(".config"))
        .join("thali")
}

fn home_or_tmp() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("beacon.milliseconds_to_expire is {0}ms; the wire format caps expiration at one day")]
    BeaconLifetimeOutOfRange(u64),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ThaliConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            ThaliConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Reject values the rest of the system cannot honor. Catches a bad
    /// file or env override at startup rather than deep in a component.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let max_ms = crate::beacon::MAX_EXPIRATION_SECONDS as u64 * 1_000;
        if self.beacon.milliseconds_to_expire > max_ms {
            return Err(ConfigError::BeaconLifetimeOutOfRange(
                self.beacon.milliseconds_to_expire,
            ));
        }
        Ok(())
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("THALI_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&ThaliConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply THALI_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("THALI_PEERS__TCP_UNAVAILABILITY_MS") {
            if let Ok(ms) = v.parse() {
                self.peers.tcp_peer_unavailability_threshold_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("THALI_PEERS__NON_TCP_UNAVAILABILITY_MS") {
            if let Ok(ms) = v.parse() {
                self.peers.non_tcp_peer_unavailability_threshold_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("THALI_SSDP__ADVERTISEMENT_INTERVAL_MS") {
            if let Ok(ms) = v.parse() {
                self.ssdp.advertisement_interval_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("THALI_SSDP__PORT") {
            if let Ok(port) = v.parse() {
                self.ssdp.port = port;
            }
        }
        if let Ok(v) = std::env::var("THALI_BEACON__MILLISECONDS_TO_EXPIRE") {
            if let Ok(ms) = v.parse() {
                self.beacon.milliseconds_to_expire = ms;
            }
        }
        if let Ok(v) = std::env::var("THALI_REPLICATION__BASE_DB_PATH") {
            self.replication.base_db_path = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_expected_tunables() {
        let config = ThaliConfig::default();
        assert_eq!(config.ssdp.advertisement_interval_ms, 500);
        assert_eq!(config.peers.tcp_peer_unavailability_threshold_ms, 3_000);
        assert_eq!(config.replication.base_db_path, "/db");
        assert_eq!(config.replication.local_seq_point_prefix, "thali_");
    }

    #[test]
    fn duration_accessors_convert_millis() {
        let config = ThaliConfig::default();
        assert_eq!(
            config.peers.tcp_peer_unavailability_threshold(),
            Duration::from_secs(3)
        );
        assert_eq!(
            config.ssdp.advertisement_interval(),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut config = ThaliConfig::default();
        config.ssdp.port = 0;
        config.replication.pool_max_concurrency = 9;

        let text = toml::to_string_pretty(&config).unwrap();
        let back: ThaliConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.ssdp.port, 0);
        assert_eq!(back.replication.pool_max_concurrency, 9);
    }

    #[test]
    fn validate_caps_beacon_lifetime_at_one_day() {
        let mut config = ThaliConfig::default();
        config.beacon.milliseconds_to_expire = 86_400_000;
        assert!(config.validate().is_ok());

        config.beacon.milliseconds_to_expire = 86_400_001;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BeaconLifetimeOutOfRange(86_400_001))
        ));
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let back: ThaliConfig = toml::from_str("[ssdp]\nport = 19001\n").unwrap();
        assert_eq!(back.ssdp.port, 19001);
        assert_eq!(back.ssdp.advertisement_interval_ms, 500);
        assert_eq!(back.beacon.milliseconds_to_expire, 3_600_000);
    }
}
