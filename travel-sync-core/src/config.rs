//! Engine timing and conflict-resolution settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::replication::TieBreak;

pub const DEFAULT_SYNC_PERIOD_MS: u64 = 25;
pub const DEFAULT_HEARTBEAT_PERIOD_MS: u64 = 2500;
pub const DEFAULT_DEVICE_SEEN_RECENTLY_MS: u64 = 5000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Interval between replication ticks.
    pub sync_period_ms: u64,
    /// Interval between device liveness writes.
    pub heartbeat_period_ms: u64,
    /// Devices not seen within this window are not offered as cast targets.
    pub device_seen_recently_ms: u64,
    pub tie_break: TieBreak,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync_period_ms: DEFAULT_SYNC_PERIOD_MS,
            heartbeat_period_ms: DEFAULT_HEARTBEAT_PERIOD_MS,
            device_seen_recently_ms: DEFAULT_DEVICE_SEEN_RECENTLY_MS,
            tie_break: TieBreak::default(),
        }
    }
}

impl EngineConfig {
    pub fn sync_period(&self) -> Duration {
        Duration::from_millis(self.sync_period_ms)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }

    pub fn device_seen_recently(&self) -> Duration {
        Duration::from_millis(self.device_seen_recently_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.sync_period(), Duration::from_millis(25));
        assert_eq!(config.heartbeat_period(), Duration::from_millis(2500));
        assert_eq!(config.device_seen_recently(), Duration::from_secs(5));
        assert_eq!(config.tie_break, TieBreak::FirstObserved);
    }

    #[test]
    fn test_partial_deserialize_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"sync_period_ms": 10, "tie_break": "greatest_value"}"#)
                .unwrap();
        assert_eq!(config.sync_period_ms, 10);
        assert_eq!(config.tie_break, TieBreak::GreatestValue);
        assert_eq!(config.heartbeat_period_ms, DEFAULT_HEARTBEAT_PERIOD_MS);
    }
}
