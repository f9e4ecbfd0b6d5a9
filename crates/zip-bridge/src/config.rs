//! Bridge runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use zip_types::{StreamerConfig, DEFAULT_RATE_HZ, DEFAULT_TTL_MS, MAX_RATE_HZ};

fn default_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud() -> u32 {
    115_200
}

fn default_rate_hz() -> f64 {
    DEFAULT_RATE_HZ
}

fn default_ttl_ms() -> u32 {
    DEFAULT_TTL_MS
}

fn default_handshake_timeout_ms() -> u64 {
    2_000
}

fn default_pending_timeout_ms() -> u64 {
    1_000
}

fn default_diagnostics_timeout_ms() -> u64 {
    500
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_rate_limit_hz() -> u32 {
    MAX_RATE_HZ as u32
}

fn default_rate_limit_idle_secs() -> u64 {
    300
}

fn default_rate_limit_capacity() -> usize {
    64
}

/// Everything [`RobotBridge`][crate::bridge::RobotBridge] needs to run.
///
/// Every field has a default, so a partial TOML table is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Serial device path.
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Cadence used when `start` is called without one.
    #[serde(default = "default_rate_hz")]
    pub default_rate_hz: f64,
    /// TTL used when `start`/`update` are called without one.
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u32,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Age after which an unacknowledged command is dropped.
    #[serde(default = "default_pending_timeout_ms")]
    pub pending_timeout_ms: u64,
    #[serde(default = "default_diagnostics_timeout_ms")]
    pub diagnostics_timeout_ms: u64,
    /// How often the link drains inbound lines.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// JSONL event log.  `None` disables the file.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// Per-client motion call budget.
    #[serde(default = "default_rate_limit_hz")]
    pub rate_limit_hz: u32,
    /// Idle clients are forgotten after this long.
    #[serde(default = "default_rate_limit_idle_secs")]
    pub rate_limit_idle_secs: u64,
    /// Most clients tracked at once.
    #[serde(default = "default_rate_limit_capacity")]
    pub rate_limit_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud: default_baud(),
            default_rate_hz: default_rate_hz(),
            default_ttl_ms: default_ttl_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            pending_timeout_ms: default_pending_timeout_ms(),
            diagnostics_timeout_ms: default_diagnostics_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            log_path: None,
            rate_limit_hz: default_rate_limit_hz(),
            rate_limit_idle_secs: default_rate_limit_idle_secs(),
            rate_limit_capacity: default_rate_limit_capacity(),
        }
    }
}

impl BridgeConfig {
    /// Streamer defaults derived from this config.
    pub fn streamer_defaults(&self) -> StreamerConfig {
        StreamerConfig {
            rate_hz: self.default_rate_hz,
            ttl_ms: self.default_ttl_ms,
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn pending_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_timeout_ms)
    }

    pub fn diagnostics_timeout(&self) -> Duration {
        Duration::from_millis(self.diagnostics_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn rate_limit_idle(&self) -> Duration {
        Duration::from_secs(self.rate_limit_idle_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_firmware() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.baud, 115_200);
        assert_eq!(cfg.default_rate_hz, 10.0);
        assert_eq!(cfg.default_ttl_ms, 200);
        assert_eq!(cfg.rate_limit_hz, 50);
        assert!(cfg.log_path.is_none());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: BridgeConfig = toml::from_str("port = \"/dev/ttyACM0\"\nbaud = 57600\n").unwrap();
        assert_eq!(cfg.port, "/dev/ttyACM0");
        assert_eq!(cfg.baud, 57_600);
        assert_eq!(cfg.handshake_timeout_ms, 2_000);
        assert_eq!(cfg.streamer_defaults(), StreamerConfig::default());
    }
}
