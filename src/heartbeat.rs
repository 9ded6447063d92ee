//! Heartbeat-based liveness tracking for registered peers.

use crate::config::HeartbeatConfig;
use crate::protocol::PeerId;
use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy,
}

struct PeerLiveness {
    consecutive_failures: u32,
    health: Health,
}

pub struct HeartbeatTracker {
    config: HeartbeatConfig,
    peers: DashMap<PeerId, PeerLiveness>,
}

impl HeartbeatTracker {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            peers: DashMap::new(),
        }
    }

    pub fn register(&self, peer: PeerId) {
        self.peers.entry(peer).or_insert(PeerLiveness {
            consecutive_failures: 0,
            health: Health::Healthy,
        });
    }

    pub fn record_success(&self, peer: PeerId) {
        if let Some(mut p) = self.peers.get_mut(&peer) {
            p.consecutive_failures = 0;
            p.health = Health::Healthy;
        }
    }

    /// Returns the peer's health after recording the failure.
    pub fn record_failure(&self, peer: PeerId) -> Health {
        let mut entry = self.peers.entry(peer).or_insert(PeerLiveness {
            consecutive_failures: 0,
            health: Health::Healthy,
        });
        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= self.config.failure_threshold {
            entry.health = Health::Unhealthy;
        }
        entry.health
    }

    pub fn health_of(&self, peer: &PeerId) -> Option<Health> {
        self.peers.get(peer).map(|p| p.health)
    }

    pub fn healthy_peers(&self) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|e| e.health == Health::Healthy)
            .map(|e| *e.key())
            .collect()
    }

    pub fn unregister(&self, peer: &PeerId) {
        self.peers.remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HeartbeatConfig {
        HeartbeatConfig {
            interval_secs: 30,
            failure_threshold: 3,
        }
    }

    #[test]
    fn stays_healthy_below_failure_threshold() {
        let tracker = HeartbeatTracker::new(config());
        let peer = [1u8; 32];
        tracker.register(peer);
        tracker.record_failure(peer);
        tracker.record_failure(peer);
        assert_eq!(tracker.health_of(&peer), Some(Health::Healthy));
    }

    #[test]
    fn becomes_unhealthy_at_threshold() {
        let tracker = HeartbeatTracker::new(config());
        let peer = [1u8; 32];
        tracker.register(peer);
        for _ in 0..3 {
            tracker.record_failure(peer);
        }
        assert_eq!(tracker.health_of(&peer), Some(Health::Unhealthy));
    }

    #[test]
    fn success_resets_failure_count_and_health() {
        let tracker = HeartbeatTracker::new(config());
        let peer = [1u8; 32];
        tracker.register(peer);
        for _ in 0..3 {
            tracker.record_failure(peer);
        }
        tracker.record_success(peer);
        assert_eq!(tracker.health_of(&peer), Some(Health::Healthy));
    }

    #[test]
    fn healthy_peers_excludes_unhealthy() {
        let tracker = HeartbeatTracker::new(config());
        let a = [1u8; 32];
        let b = [2u8; 32];
        tracker.register(a);
        tracker.register(b);
        for _ in 0..3 {
            tracker.record_failure(b);
        }
        assert_eq!(tracker.healthy_peers(), vec![a]);
    }
}
