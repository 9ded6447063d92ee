//! Aggregated runtime configuration for the mesh core.
//!
//! Defaults match the literal values named throughout the design: k-bucket
//! size, lookup parallelism, replication factor, TTLs, timeouts, rate-limit
//! and chunking thresholds, retry policy. Loadable from TOML or built up in
//! tests via [`MeshConfig::builder`] without touching process-global state.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub dht: DhtConfig,
    pub session: SessionConfig,
    pub chunking: ChunkingConfig,
    pub rate_limit: RateLimitConfig,
    pub heartbeat: HeartbeatConfig,
    pub retry: RetryConfig,
    pub replay_window_secs: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            dht: DhtConfig::default(),
            session: SessionConfig::default(),
            chunking: ChunkingConfig::default(),
            rate_limit: RateLimitConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            retry: RetryConfig::default(),
            replay_window_secs: 60,
        }
    }
}

impl MeshConfig {
    pub fn builder() -> MeshConfigBuilder {
        MeshConfigBuilder(MeshConfig::default())
    }

    pub fn from_toml_str(s: &str) -> Result<Self, crate::Error> {
        toml::from_str(s).map_err(|e| crate::Error::Config(e.to_string()))
    }

    pub fn replay_window(&self) -> Duration {
        Duration::from_secs(self.replay_window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    pub k: usize,
    pub alpha: usize,
    pub replication_factor: usize,
    pub value_ttl_secs: u64,
    pub bucket_refresh_interval_secs: u64,
    pub republish_interval_secs: u64,
    pub rpc_timeout_secs: u64,
    pub failure_threshold: u32,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: 20,
            alpha: 3,
            replication_factor: 3,
            value_ttl_secs: 86_400,
            bucket_refresh_interval_secs: 3_600,
            republish_interval_secs: 3_600,
            rpc_timeout_secs: 5,
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub timeout_secs: u64,
    pub handshake_step_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 3_600,
            handshake_step_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub auto_chunk_threshold_bytes: usize,
    pub chunk_size_bytes: usize,
    pub stale_transfer_ttl_secs: u64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            auto_chunk_threshold_bytes: 10 * 1024,
            chunk_size_bytes: 32 * 1024,
            stale_transfer_ttl_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    pub burst_size: u32,
    pub violations_before_block: u32,
    pub block_duration_secs: u64,
    pub idle_cleanup_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 600,
            requests_per_hour: 12_000,
            burst_size: 50,
            violations_before_block: 5,
            block_duration_secs: 300,
            idle_cleanup_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
    pub failure_threshold: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 200,
        }
    }
}

pub struct MeshConfigBuilder(MeshConfig);

impl MeshConfigBuilder {
    pub fn dht(mut self, f: impl FnOnce(DhtConfig) -> DhtConfig) -> Self {
        self.0.dht = f(self.0.dht);
        self
    }

    pub fn session(mut self, f: impl FnOnce(SessionConfig) -> SessionConfig) -> Self {
        self.0.session = f(self.0.session);
        self
    }

    pub fn heartbeat(mut self, f: impl FnOnce(HeartbeatConfig) -> HeartbeatConfig) -> Self {
        self.0.heartbeat = f(self.0.heartbeat);
        self
    }

    pub fn replay_window_secs(mut self, secs: u64) -> Self {
        self.0.replay_window_secs = secs;
        self
    }

    pub fn build(self) -> MeshConfig {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_literals() {
        let c = MeshConfig::default();
        assert_eq!(c.dht.k, 20);
        assert_eq!(c.dht.alpha, 3);
        assert_eq!(c.dht.replication_factor, 3);
        assert_eq!(c.chunking.auto_chunk_threshold_bytes, 10 * 1024);
        assert_eq!(c.chunking.chunk_size_bytes, 32 * 1024);
        assert_eq!(c.heartbeat.interval_secs, 30);
        assert_eq!(c.heartbeat.failure_threshold, 3);
        assert_eq!(c.replay_window_secs, 60);
    }

    #[test]
    fn builder_overrides_nested_fields() {
        let c = MeshConfig::builder()
            .heartbeat(|mut h| {
                h.interval_secs = 1;
                h
            })
            .replay_window_secs(2)
            .build();
        assert_eq!(c.heartbeat.interval_secs, 1);
        assert_eq!(c.replay_window_secs, 2);
    }

    #[test]
    fn round_trips_through_toml() {
        let c = MeshConfig::default();
        let s = toml::to_string(&c).unwrap();
        let back = MeshConfig::from_toml_str(&s).unwrap();
        assert_eq!(back.dht.k, c.dht.k);
    }
}
