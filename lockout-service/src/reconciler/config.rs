//! Reconciler configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconciler configuration
///
/// # Example (config.toml)
///
/// ```toml
/// [reconciler]
/// lanes = 4
/// lane_queue_capacity = 64
/// retry_max_attempts = 5
/// retry_base_delay_ms = 100
/// retry_max_delay_ms = 5000
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Sequential workers; each identity always lands on the same one
    #[serde(default = "default_lanes")]
    pub lanes: usize,

    /// Deliveries buffered per lane before reading from the channel pauses
    #[serde(default = "default_lane_queue_capacity")]
    pub lane_queue_capacity: usize,

    /// Store attempts per event, including the first
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    /// Delay before the first retry in milliseconds
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Upper bound on any single retry delay in milliseconds
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl ReconcilerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.lanes == 0 {
            return Err("lanes must be greater than 0".to_string());
        }
        if self.lane_queue_capacity == 0 {
            return Err("lane_queue_capacity must be greater than 0".to_string());
        }
        if self.retry_max_attempts == 0 {
            return Err("retry_max_attempts must be at least 1".to_string());
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err("retry_base_delay_ms must not exceed retry_max_delay_ms".to_string());
        }
        Ok(())
    }

    /// Builder-style lane count override
    pub fn with_lanes(mut self, lanes: usize) -> Self {
        self.lanes = lanes;
        self
    }

    /// Builder-style retry policy override
    pub fn with_retry(mut self, max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.retry_max_attempts = max_attempts;
        self.retry_base_delay_ms = base_delay_ms;
        self.retry_max_delay_ms = max_delay_ms;
        self
    }

    /// Most deliveries the reconciler holds at once: one in hand plus a full queue per lane
    pub fn max_in_flight(&self) -> usize {
        self.lanes
            .max(1)
            .saturating_mul(self.lane_queue_capacity.max(1).saturating_add(1))
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            lanes: default_lanes(),
            lane_queue_capacity: default_lane_queue_capacity(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

fn default_lanes() -> usize {
    4
}

fn default_lane_queue_capacity() -> usize {
    64
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

fn default_retry_max_delay_ms() -> u64 {
    5000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.lanes, 4);
        assert_eq!(config.retry_max_attempts, 5);
        assert_eq!(config.retry_base_delay(), Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_nonsense() {
        assert!(ReconcilerConfig::default().with_lanes(0).validate().is_err());
        assert!(ReconcilerConfig::default()
            .with_retry(0, 10, 100)
            .validate()
            .is_err());
        assert!(ReconcilerConfig::default()
            .with_retry(3, 500, 100)
            .validate()
            .is_err());
    }

    #[test]
    fn test_max_in_flight_covers_queues_and_workers() {
        assert_eq!(ReconcilerConfig::default().max_in_flight(), 4 * 65);
        assert_eq!(ReconcilerConfig::default().with_lanes(1).max_in_flight(), 65);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: ReconcilerConfig =
            serde_json::from_str(r#"{"lanes": 2}"#).unwrap();
        assert_eq!(config.lanes, 2);
        assert_eq!(config.retry_max_delay_ms, 5000);
    }
}
