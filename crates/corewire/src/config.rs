use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_bind_addrs() -> Vec<String> {
    Vec::new()
}

fn default_mem_cache_bytes() -> u64 {
    4 * 1024 * 1024
}

fn default_temp_dir() -> Option<PathBuf> {
    None
}

fn default_connect_timeout_ms() -> u64 {
    300
}

fn default_liveness_tick_ms() -> u64 {
    2_000
}

fn default_idle_threshold_ms() -> u64 {
    8_000
}

fn default_unresponsive_threshold_ms() -> u64 {
    8_000
}

fn default_reconnect_interval_ms() -> u64 {
    2_000
}

fn default_max_header_bytes() -> usize {
    8 * 1024
}

fn default_max_chunk_bytes() -> usize {
    65_535
}

fn default_max_ws_payload_bytes() -> u64 {
    2 * 1024 * 1024 * 1024
}

/// Tunables for every component in this crate.
///
/// Deserialized from an optional TOML file; every field falls back to its
/// documented default when the file is absent or a field is omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Addresses this process should listen on (`"host:port"`), if any.
    pub bind_addrs: Vec<String>,
    /// In-memory cap for a [`crate::resource::DataResource`] before it spills
    /// to a temp file.
    pub mem_cache_bytes: u64,
    /// Directory for overflow temp files; `None` uses the OS default.
    pub temp_dir: Option<PathBuf>,
    /// Cumulative timeout across all resolved addresses for an outbound
    /// connect.
    pub connect_timeout_ms: u64,
    /// Liveness monitor tick interval.
    pub liveness_tick_ms: u64,
    /// Idle duration after which a connected peer is pinged.
    pub idle_threshold_ms: u64,
    /// Idle duration after a ping after which a peer is declared
    /// unresponsive.
    pub unresponsive_threshold_ms: u64,
    /// Interval between outbound reconnect attempts.
    pub reconnect_interval_ms: u64,
    /// Cap on accumulated framer header bytes before a parse failure.
    pub max_header_bytes: usize,
    /// Cap on a single HTTP chunked-transfer chunk.
    pub max_chunk_bytes: usize,
    /// Cap on a WebSocket frame's declared payload length.
    pub max_ws_payload_bytes: u64,
    /// Optional TLS material: (cert chain path, private key path).
    pub tls_cert_key: Option<(PathBuf, PathBuf)>,
    /// Optional path to a PEM bundle of trusted CA certificates.
    pub tls_ca_path: Option<PathBuf>,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            bind_addrs: default_bind_addrs(),
            mem_cache_bytes: default_mem_cache_bytes(),
            temp_dir: default_temp_dir(),
            connect_timeout_ms: default_connect_timeout_ms(),
            liveness_tick_ms: default_liveness_tick_ms(),
            idle_threshold_ms: default_idle_threshold_ms(),
            unresponsive_threshold_ms: default_unresponsive_threshold_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            max_header_bytes: default_max_header_bytes(),
            max_chunk_bytes: default_max_chunk_bytes(),
            max_ws_payload_bytes: default_max_ws_payload_bytes(),
            tls_cert_key: None,
            tls_ca_path: None,
        }
    }
}

impl NetConfig {
    /// Parses a `NetConfig` from TOML text, falling back to defaults for
    /// anything the text leaves unset.
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn liveness_tick(&self) -> Duration {
        Duration::from_millis(self.liveness_tick_ms)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_millis(self.idle_threshold_ms)
    }

    pub fn unresponsive_threshold(&self) -> Duration {
        Duration::from_millis(self.unresponsive_threshold_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = NetConfig::default();
        assert_eq!(cfg.mem_cache_bytes, 4 * 1024 * 1024);
        assert_eq!(cfg.connect_timeout_ms, 300);
        assert_eq!(cfg.liveness_tick_ms, 2_000);
        assert_eq!(cfg.idle_threshold_ms, 8_000);
        assert_eq!(cfg.max_chunk_bytes, 65_535);
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let cfg = NetConfig::from_toml_str("connect_timeout_ms = 750\n").unwrap();
        assert_eq!(cfg.connect_timeout_ms, 750);
        assert_eq!(cfg.liveness_tick_ms, 2_000);
    }
}
