//! Replay protection: accepts or rejects a `(nonce, timestamp)` pair
//! against a sliding acceptance window.

use dashmap::DashMap;
use std::time::{SystemTime, UNIX_EPOCH};

const GC_INTERVAL_SECS: u64 = 120;

pub struct ReplayProtector {
    window_secs: u64,
    seen: DashMap<String, u64>,
}

impl ReplayProtector {
    pub fn new(window_secs: u64) -> Self {
        Self {
            window_secs,
            seen: DashMap::new(),
        }
    }

    /// Returns `true` if the envelope should be accepted: the timestamp is
    /// within the window and the nonce has not been seen before. Recording
    /// happens as a side effect of acceptance.
    pub fn check_and_record(&self, nonce: &str, message_timestamp_secs: u64) -> bool {
        let now = now_secs();
        let age = now.abs_diff(message_timestamp_secs);
        if age > self.window_secs {
            return false;
        }
        if self.seen.contains_key(nonce) {
            return false;
        }
        self.seen.insert(nonce.to_string(), now);
        true
    }

    /// Drops entries older than [`GC_INTERVAL_SECS`]. Intended to be called
    /// periodically by a background task.
    pub fn gc(&self) {
        let now = now_secs();
        self.seen
            .retain(|_, first_seen| now.saturating_sub(*first_seen) < GC_INTERVAL_SECS);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_fresh_nonce_within_window() {
        let rp = ReplayProtector::new(60);
        assert!(rp.check_and_record("abc", now_secs()));
    }

    #[test]
    fn rejects_exact_replay() {
        let rp = ReplayProtector::new(60);
        assert!(rp.check_and_record("abc", now_secs()));
        assert!(!rp.check_and_record("abc", now_secs()));
    }

    #[test]
    fn rejects_stale_timestamp() {
        let rp = ReplayProtector::new(60);
        assert!(!rp.check_and_record("abc", now_secs().saturating_sub(3600)));
    }

    #[test]
    fn gc_drops_old_entries() {
        let rp = ReplayProtector::new(60);
        rp.seen.insert("old".to_string(), 0);
        rp.gc();
        assert!(rp.is_empty());
    }
}
