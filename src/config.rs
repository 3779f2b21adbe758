//! Client tuning knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Client tuning, loadable from JSON; missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Periodic full refetch cadence; `0` disables the background tick.
    pub refresh_interval_ms: u64,
    /// Minimum gap between successful balances-only refreshes.
    pub balance_refresh_cooldown_ms: u64,
    /// Extra attempts allowed on transient transport failures.
    pub transport_retry_budget: u32,
    /// Queue optimistic edits per entity instead of last-writer-wins.
    pub serialize_entity_mutations: bool,
    /// Capacity of the cache event broadcast channel.
    pub event_channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: 60_000,
            balance_refresh_cooldown_ms: 300_000,
            transport_retry_budget: 1,
            serialize_entity_mutations: false,
            event_channel_capacity: 256,
        }
    }
}

impl ClientConfig {
    /// Parses a JSON document; missing keys keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Background tick period, or `None` when disabled.
    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_ms > 0).then(|| Duration::from_millis(self.refresh_interval_ms))
    }

    /// Cooldown between successful balances-only refreshes.
    pub fn balance_refresh_cooldown(&self) -> Duration {
        Duration::from_millis(self.balance_refresh_cooldown_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let cfg = ClientConfig::from_json_str(r#"{"refresh_interval_ms": 0, "serialize_entity_mutations": true}"#)
            .expect("parse");
        assert_eq!(cfg.refresh_interval(), None);
        assert!(cfg.serialize_entity_mutations);
        assert_eq!(cfg.transport_retry_budget, 1);
        assert_eq!(cfg.balance_refresh_cooldown(), Duration::from_secs(300));
    }

    #[test]
    fn unknown_types_are_rejected() {
        assert!(ClientConfig::from_json_str(r#"{"transport_retry_budget": "many"}"#).is_err());
    }
}
