//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use ticl_core::proto::{
    CLIENT_MAJOR_VERSION, CLIENT_MINOR_VERSION, PROTOCOL_MAJOR_VERSION, PROTOCOL_MINOR_VERSION,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Minimum gap between outbound batched messages.
    pub batching_delay_ms: u64,
    /// Inbound messages with a different major version are dropped.
    pub protocol_major_version: u32,
    pub protocol_minor_version: u32,
    pub client_major_version: u32,
    pub client_minor_version: u32,
    /// Default heartbeat interval; the server may override it.
    pub heartbeat_interval_ms: u64,
    /// Default invalidation-poll interval; the server may override it.
    pub polling_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batching_delay_ms: 500,
            protocol_major_version: PROTOCOL_MAJOR_VERSION,
            protocol_minor_version: PROTOCOL_MINOR_VERSION,
            client_major_version: CLIENT_MAJOR_VERSION,
            client_minor_version: CLIENT_MINOR_VERSION,
            heartbeat_interval_ms: 20 * 60 * 1000,
            polling_interval_ms: 10 * 60 * 1000,
        }
    }
}

impl Config {
    pub fn batching_delay(&self) -> Duration {
        Duration::from_millis(self.batching_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.batching_delay_ms > 0);
        assert_eq!(config.protocol_major_version, PROTOCOL_MAJOR_VERSION);
        assert!(config.heartbeat_interval_ms > config.polling_interval_ms);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: Config = serde_json::from_str(r#"{"batching_delay_ms": 100}"#).unwrap();
        assert_eq!(config.batching_delay_ms, 100);
        assert_eq!(config.polling_interval_ms, Config::default().polling_interval_ms);
    }
}
