//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BASE_RETRY_DELAY_MS: u64 = 1_000;
const DEFAULT_EVENT_CAPACITY: usize = 256;
/// Upper bound on a single backoff step
const MAX_RETRY_DELAY_MS: u64 = 60 * 60 * 1_000;

/// Tunables for the offline queue and sync engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Failed attempts tolerated before an operation is evicted
    pub max_retries: u32,
    /// First backoff step; doubled on every further failure
    pub base_retry_delay_ms: u64,
    /// Buffer size of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_retry_delay_ms: DEFAULT_BASE_RETRY_DELAY_MS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Parse a config from JSON, filling missing fields with defaults
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Delay before retrying an operation that has failed `retry_count` times
    /// before this failure: `base * 2^retry_count`, capped at one hour.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let factor = 1_u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        let millis = self
            .base_retry_delay_ms
            .saturating_mul(factor)
            .min(MAX_RETRY_DELAY_MS);
        Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_retry_delay_ms, 1_000);
        assert_eq!(config.event_capacity, 256);
    }

    #[test]
    fn from_json_fills_missing_fields() {
        let config = EngineConfig::from_json(r#"{"max_retries": 5}"#).unwrap();
        assert_eq!(
            config,
            EngineConfig {
                max_retries: 5,
                ..EngineConfig::default()
            }
        );
        assert!(EngineConfig::from_json("not json").is_err());
    }

    #[test]
    fn backoff_doubles_and_saturates() {
        let config = EngineConfig::default();
        assert_eq!(config.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(config.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(config.backoff_delay(3), Duration::from_secs(8));
        assert_eq!(config.backoff_delay(90), Duration::from_secs(3_600));
    }
}
