//! # Engine Configuration
//!
//! Tunables for delivery batching and per-connection limits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Subscription engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Quiescence window before a batched delivery is flushed,
    /// in milliseconds (default: 1)
    #[serde(default = "default_flush_delay_ms")]
    pub flush_delay_ms: u64,

    /// Maximum subscriptions per connection (default: 100)
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_connection: usize,
}

fn default_flush_delay_ms() -> u64 {
    1
}

fn default_max_subscriptions() -> usize {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flush_delay_ms: default_flush_delay_ms(),
            max_subscriptions_per_connection: default_max_subscriptions(),
        }
    }
}

impl EngineConfig {
    /// Flush delay as a [`Duration`]
    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }
}
