//! Gateway configuration.
//!
//! All structs deserialize with serde and fall back to defaults for missing
//! fields, so a config file only needs to name what it changes:
//!
//! ```
//! # use kpa_gateway::GatewayConfig;
//! let config: GatewayConfig = serde_json::from_str(
//!     r#"{ "multiplexer": { "bind_addr": "127.0.0.1:4100" }, "worker_tick_ms": 10 }"#,
//! ).unwrap();
//! assert_eq!(config.multiplexer.bind_addr.port(), 4100);
//! assert_eq!(config.multiplexer.read_chunk_size, 1024);
//! ```
//!
//! Durations are written as integer milliseconds.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::transport::MultiplexerConfig;
use crate::worker::{DEFAULT_JOIN_TIMEOUT, DEFAULT_TICK};

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Network side.
    pub multiplexer: MultiplexerConfig,
    /// How often a periodic worker checks whether its period has elapsed.
    #[serde(rename = "worker_tick_ms", deserialize_with = "millis")]
    pub worker_tick: Duration,
    /// How long stopping a worker waits for a task in progress.
    #[serde(rename = "worker_join_timeout_ms", deserialize_with = "millis")]
    pub worker_join_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            multiplexer: MultiplexerConfig::default(),
            worker_tick: DEFAULT_TICK,
            worker_join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

/// Deserialize a `Duration` from integer milliseconds.
pub(crate) fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config: GatewayConfig = serde_json::from_str("{}").unwrap();

        assert_eq!(config.worker_tick, Duration::from_millis(5));
        assert_eq!(config.worker_join_timeout, Duration::from_millis(200));
        assert_eq!(config.multiplexer.bind_addr.port(), 4000);
        assert_eq!(config.multiplexer.inbound_queue_capacity, 1024);
        assert_eq!(config.multiplexer.outbound_queue_capacity, 1024);
        assert_eq!(config.multiplexer.join_timeout, Duration::from_millis(200));
    }

    #[test]
    fn test_overrides() {
        let config: GatewayConfig = serde_json::from_str(
            r#"{
                "multiplexer": {
                    "bind_addr": "127.0.0.1:0",
                    "read_chunk_size": 4096,
                    "poll_timeout_ms": 20
                },
                "worker_tick_ms": 1,
                "worker_join_timeout_ms": 50
            }"#,
        )
        .unwrap();

        assert_eq!(config.worker_tick, Duration::from_millis(1));
        assert_eq!(config.worker_join_timeout, Duration::from_millis(50));
        assert_eq!(config.multiplexer.read_chunk_size, 4096);
        assert_eq!(config.multiplexer.poll_timeout, Duration::from_millis(20));
        assert_eq!(config.multiplexer.inbound_queue_capacity, 1024);
    }

    #[test]
    fn test_bad_address_rejected() {
        let result: Result<GatewayConfig, _> =
            serde_json::from_str(r#"{ "multiplexer": { "bind_addr": "nowhere" } }"#);
        assert!(result.is_err());
    }
}
