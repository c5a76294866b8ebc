//! Daemon configuration surface (spec §6).
//!
//! The core never reads files beyond the index directory itself; an
//! external config loader (out of scope per spec §1) is expected to
//! populate this struct from `config.json` and hand it to [`crate::server`]
//! and [`crate::client`] at startup.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub enabled: bool,
    pub ttl_minutes: u64,
    pub eviction_check_seconds: u64,
    pub auto_shutdown_on_idle: bool,
    pub max_concurrent_connections: usize,
    pub retry_delays_ms: Vec<u64>,
    pub restart_attempts_on_crash: u8,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_minutes: 10,
            eviction_check_seconds: 60,
            auto_shutdown_on_idle: false,
            max_concurrent_connections: 256,
            retry_delays_ms: vec![100, 500, 1000, 2000],
            restart_attempts_on_crash: 2,
        }
    }
}

impl DaemonConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_minutes * 60)
    }

    pub fn eviction_check_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_check_seconds)
    }

    pub fn retry_delays(&self) -> Vec<Duration> {
        self.retry_delays_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_documented_retry_schedule() {
        let config = DaemonConfig::default();
        assert_eq!(config.retry_delays_ms, vec![100, 500, 1000, 2000]);
        assert_eq!(config.restart_attempts_on_crash, 2);
    }

    #[test]
    fn ttl_minutes_converts_to_seconds() {
        let config = DaemonConfig {
            ttl_minutes: 5,
            ..Default::default()
        };
        assert_eq!(config.ttl(), Duration::from_secs(300));
    }
}
