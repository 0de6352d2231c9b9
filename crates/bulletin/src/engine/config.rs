use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ledger::DEFAULT_LEDGER_KEY;

/// Tunables for a sync engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Key the read ledger is stored under
    pub ledger_key: String,
    /// First reconnect delay after the feed drops
    pub reconnect_initial_delay_ms: u64,
    /// Upper bound for the doubling reconnect delay
    pub reconnect_max_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ledger_key: DEFAULT_LEDGER_KEY.to_string(),
            reconnect_initial_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
        }
    }
}

impl EngineConfig {
    /// Parse a config from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> crate::BulletinResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set the key the read ledger is stored under
    pub fn set_ledger_key(&mut self, key: impl Into<String>) {
        self.ledger_key = key.into();
    }

    /// Set the reconnect backoff bounds
    pub fn set_reconnect_delays(&mut self, initial: Duration, max: Duration) {
        self.reconnect_initial_delay_ms = saturating_millis(initial);
        self.reconnect_max_delay_ms = saturating_millis(max);
    }

    /// Delay before reconnect attempt number `attempt` (starting at 0)
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let millis = self
            .reconnect_initial_delay_ms
            .saturating_mul(factor)
            .min(self.reconnect_max_delay_ms);
        Duration::from_millis(millis)
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
