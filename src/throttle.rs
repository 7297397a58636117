use crate::models::DedupKey;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct Entry {
    /// Payload timestamp (unix ms) of the last accepted reading.
    timestamp_ms: i64,
    /// When the entry was last written, on the local clock.
    recorded_at: Instant,
}

/// Last accepted timestamp per topic and serial number.
#[derive(Debug, Default)]
pub struct ThrottleState {
    last_accepted: Mutex<HashMap<DedupKey, Entry>>,
}

impl ThrottleState {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<DedupKey, Entry>> {
        // A panic while holding the guard cannot leave the map half-written.
        self.last_accepted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// True when no reading was accepted for `key` yet, or the last one is at
    /// least `interval_ms` older than `timestamp_ms`.
    pub fn should_accept(&self, key: &DedupKey, timestamp_ms: i64, interval_ms: i64) -> bool {
        match self.entries().get(key) {
            Some(last) => timestamp_ms.saturating_sub(last.timestamp_ms) >= interval_ms,
            None => true,
        }
    }

    /// Stores `timestamp_ms` for `key`. The timestamp never moves backwards;
    /// the entry counts as fresh again either way.
    pub fn record(&self, key: DedupKey, timestamp_ms: i64) {
        let now = Instant::now();
        let mut entries = self.entries();
        let entry = entries.entry(key).or_insert(Entry {
            timestamp_ms,
            recorded_at: now,
        });
        entry.timestamp_ms = entry.timestamp_ms.max(timestamp_ms);
        entry.recorded_at = now;
    }

    pub fn last_accepted(&self, key: &DedupKey) -> Option<i64> {
        self.entries().get(key).map(|entry| entry.timestamp_ms)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Drops entries nobody recorded into for at least `retention`; returns
    /// how many went. Payload timestamps play no part, so a device with a
    /// skewed clock keeps its window as long as it keeps reporting.
    pub fn evict_idle(&self, retention: Duration) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| entry.recorded_at.elapsed() < retention);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!("Evicted {} throttle entries idle for {:?}", evicted, retention);
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> DedupKey {
        DedupKey::new("sensors/room1", "SN001")
    }

    #[test]
    fn unknown_key_is_always_accepted() {
        let state = ThrottleState::new();
        assert!(state.should_accept(&key(), 0, 5000));
        assert_eq!(state.len(), 0);
    }

    #[test]
    fn window_is_inclusive_at_the_interval() {
        let state = ThrottleState::new();
        state.record(key(), 10_000);

        assert!(!state.should_accept(&key(), 14_999, 5000));
        assert!(state.should_accept(&key(), 15_000, 5000));
    }

    #[test]
    fn earlier_timestamps_are_throttled() {
        let state = ThrottleState::new();
        state.record(key(), 10_000);
        assert!(!state.should_accept(&key(), 1_000, 5000));
    }

    #[test]
    fn record_never_moves_backwards() {
        let state = ThrottleState::new();
        state.record(key(), 20_000);
        state.record(key(), 12_000);
        assert_eq!(state.last_accepted(&key()), Some(20_000));

        state.record(key(), 26_000);
        assert_eq!(state.last_accepted(&key()), Some(26_000));
    }

    #[test]
    fn keys_are_independent() {
        let state = ThrottleState::new();
        state.record(key(), 10_000);

        let other_serial = DedupKey::new("sensors/room1", "SN002");
        let other_topic = DedupKey::new("sensors/room2", "SN001");
        assert!(state.should_accept(&other_serial, 10_001, 5000));
        assert!(state.should_accept(&other_topic, 10_001, 5000));
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_follows_the_local_clock_not_payload_time() {
        let state = ThrottleState::new();
        let idle = DedupKey::new("a", "1");
        // 2024-01-01, far behind any real clock.
        state.record(idle.clone(), 1_704_103_200_000);
        tokio::time::advance(Duration::from_secs(7200)).await;

        let skewed = DedupKey::new("b", "2");
        state.record(skewed.clone(), 1_704_103_200_000);

        assert_eq!(state.evict_idle(Duration::from_secs(3600)), 1);
        assert_eq!(state.len(), 1);
        assert_eq!(state.last_accepted(&skewed), Some(1_704_103_200_000));
        assert!(state.last_accepted(&idle).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn recording_an_older_reading_keeps_the_entry_alive() {
        let state = ThrottleState::new();
        state.record(key(), 10_000);
        tokio::time::advance(Duration::from_secs(3000)).await;

        // An older reading still counts as activity.
        state.record(key(), 5_000);
        tokio::time::advance(Duration::from_secs(3000)).await;

        assert_eq!(state.evict_idle(Duration::from_secs(3600)), 0);
        assert_eq!(state.last_accepted(&key()), Some(10_000));
    }
}
