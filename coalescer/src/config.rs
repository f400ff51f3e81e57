//! Engine configuration loaded from YAML.
//!
//! Only two knobs shape batching: how many parameters a window may hold and how long it may stay
//! open. Everything else has a safe default.

use std::time::Duration;

use serde::Deserialize;

use crate::error::CoalesceError;

/// Shortest accepted window timeout. Anything lower turns the scheduler into a busy trigger loop.
pub const MIN_WINDOW_TIMEOUT: Duration = Duration::from_millis(1);

fn default_window_size() -> usize {
    10
}

fn default_window_timeout_ms() -> u64 {
    1
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
/// Top-level coalescer configuration.
pub struct CoalescerConfig {
    #[serde(default = "default_window_size")]
    /// Number of accumulated parameters that forces a window to execute.
    pub window_size: usize,

    #[serde(default = "default_window_timeout_ms")]
    /// Maximum age of a window before it executes regardless of size.
    pub window_timeout_ms: u64,

    #[serde(default = "default_heartbeat_interval_ms")]
    /// Period of the scheduler's liveness log line.
    pub heartbeat_interval_ms: u64,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            window_timeout_ms: default_window_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

impl CoalescerConfig {
    /// Config with the given trigger policy and default heartbeat.
    ///
    /// The timeout is kept at millisecond resolution; sub-millisecond values round down to zero
    /// and fail validation.
    pub fn new(window_size: usize, window_timeout: Duration) -> Self {
        Self {
            window_size,
            window_timeout_ms: u64::try_from(window_timeout.as_millis()).unwrap_or(u64::MAX),
            ..Self::default()
        }
    }

    /// Parse a YAML config from bytes.
    pub fn from_yaml_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_slice(bytes)?)
    }

    pub fn window_timeout(&self) -> Duration {
        Duration::from_millis(self.window_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Reject configurations the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), CoalesceError> {
        if self.window_size == 0 {
            return Err(CoalesceError::InvalidConfiguration(
                "window_size must be greater than zero".to_string(),
            ));
        }
        if self.window_timeout() < MIN_WINDOW_TIMEOUT {
            return Err(CoalesceError::InvalidConfiguration(format!(
                "window_timeout_ms must be at least {}ms, got {}ms",
                MIN_WINDOW_TIMEOUT.as_millis(),
                self.window_timeout_ms
            )));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(CoalesceError::InvalidConfiguration(
                "heartbeat_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_for_optional_fields() {
        let cfg = CoalescerConfig::from_yaml_bytes(b"{}").unwrap();
        assert_eq!(cfg.window_size, 10);
        assert_eq!(cfg.window_timeout(), Duration::from_millis(1));
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(5));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn yaml_overrides_defaults() {
        let yaml = br#"
window_size: 3
window_timeout_ms: 50
"#;
        let cfg = CoalescerConfig::from_yaml_bytes(yaml).unwrap();
        assert_eq!(cfg, CoalescerConfig::new(3, Duration::from_millis(50)));
    }

    #[test]
    fn zero_window_size_is_rejected() {
        let cfg = CoalescerConfig::new(0, Duration::from_millis(50));
        assert!(matches!(
            cfg.validate(),
            Err(CoalesceError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn timeout_below_minimum_is_rejected() {
        let cfg = CoalescerConfig::new(3, Duration::from_micros(500));
        assert_eq!(cfg.window_timeout_ms, 0);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("at least 1ms"));
    }

    #[test]
    fn zero_heartbeat_is_rejected() {
        let cfg = CoalescerConfig {
            heartbeat_interval_ms: 0,
            ..CoalescerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_yaml_type_is_an_error() {
        assert!(CoalescerConfig::from_yaml_bytes(b"window_size: lots").is_err());
    }
}
