//! Radar driver configuration.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::protocol::{Gain, TimeWindow};

/// What to do when a transfer is requested while another one in the same
/// direction is still in flight.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingPolicy {
    /// Refuse with `RadarError::TransferPending`.
    Reject,
    /// Hold outbound commands until the in-flight one completes; reuse the
    /// in-flight inbound transfer.
    #[default]
    Queue,
}

/// Configuration for a radar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadarConfig {
    /// Handling of a second transfer in one direction.
    pub pending_policy: PendingPolicy,
    /// Commands held at most while one is in flight.
    pub outbound_queue_depth: usize,
    /// Log setup control failures and carry on instead of failing
    /// `initialize`.
    pub tolerate_setup_errors: bool,
    /// Timeout of one synchronous command write.
    pub signal_timeout_ms: u64,
    /// Timeout of one synchronous trace read.
    pub trace_timeout_ms: u64,
    /// Timeout of one setup control transfer.
    pub control_timeout_ms: u64,
    /// Longest wait of one event pump iteration.
    pub pump_timeout_ms: u64,
    /// Time window used when an acquisition does not name one.
    pub time_window: TimeWindow,
    /// Gain used when an acquisition does not name one.
    pub gain: Gain,
}

impl Default for RadarConfig {
    fn default() -> Self {
        Self {
            pending_policy: PendingPolicy::Queue,
            outbound_queue_depth: 8,
            tolerate_setup_errors: false,
            signal_timeout_ms: 400,
            trace_timeout_ms: 600,
            control_timeout_ms: 5000,
            pump_timeout_ms: 500,
            time_window: TimeWindow::Short,
            gain: Gain::Level2,
        }
    }
}

impl RadarConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RadarConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn signal_timeout(&self) -> Duration {
        Duration::from_millis(self.signal_timeout_ms)
    }

    pub fn trace_timeout(&self) -> Duration {
        Duration::from_millis(self.trace_timeout_ms)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    pub fn pump_timeout(&self) -> Duration {
        Duration::from_millis(self.pump_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::{CONTROL_TIMEOUT, SIGNAL_TIMEOUT, TRACE_TIMEOUT};

    #[test]
    fn test_defaults_match_protocol_timeouts() {
        let config = RadarConfig::default();
        assert_eq!(config.signal_timeout(), SIGNAL_TIMEOUT);
        assert_eq!(config.trace_timeout(), TRACE_TIMEOUT);
        assert_eq!(config.control_timeout(), CONTROL_TIMEOUT);
        assert_eq!(config.pending_policy, PendingPolicy::Queue);
        assert!(!config.tolerate_setup_errors);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oerad.toml");

        let config = RadarConfig {
            pending_policy: PendingPolicy::Reject,
            tolerate_setup_errors: true,
            time_window: TimeWindow::Long,
            gain: Gain::Level5,
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();

        let loaded = RadarConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: RadarConfig = toml::from_str("pending_policy = \"reject\"\n").unwrap();
        assert_eq!(config.pending_policy, PendingPolicy::Reject);
        assert_eq!(config.outbound_queue_depth, 8);
        assert_eq!(config.pump_timeout_ms, 500);
        assert_eq!(config.time_window, TimeWindow::Short);
        assert_eq!(config.gain, Gain::Level2);
    }

    #[test]
    fn test_acquisition_defaults_from_file() {
        let config: RadarConfig =
            toml::from_str("time_window = \"long\"\ngain = \"level4\"\n").unwrap();
        assert_eq!(config.time_window, TimeWindow::Long);
        assert_eq!(config.gain, Gain::Level4);
        assert!(toml::from_str::<RadarConfig>("gain = \"level9\"\n").is_err());
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(RadarConfig::load_from_file("/nonexistent/oerad.toml").is_err());
    }
}
