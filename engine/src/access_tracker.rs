//! Access tracker - per-key hot/cold classification
//!
//! Bounded map of per-key access statistics. The tracker only reports: it
//! classifies a key as hot when its recent access profile crosses the
//! configured thresholds, and the façade decides what to do with that
//! (enqueue for promotion, route an insert to the stable side).
//!
//! Counters are atomics so the migration engine can flip promotion state
//! through shared references; map-level mutation (insert, eviction, aging)
//! happens under the caller's control mutex.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use ahash::AHashMap;

/// What kind of event is being recorded for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// Point lookup answered by the staging side.
    HitStaging,
    /// Point lookup answered by the stable side.
    HitStable,
    /// Write routed through the façade.
    Insert,
}

/// Per-key statistics. Created lazily on the first tracked event, destroyed
/// when aged out; nothing persists across process restarts.
#[derive(Debug)]
pub struct KeyStat {
    access_count: AtomicU32,
    consecutive_count: AtomicU32,
    is_hot: AtomicBool,
    last_access: Instant,
    last_promotion: Option<Instant>,
}

impl KeyStat {
    fn new(now: Instant) -> Self {
        Self {
            access_count: AtomicU32::new(0),
            consecutive_count: AtomicU32::new(0),
            is_hot: AtomicBool::new(false),
            last_access: now,
            last_promotion: None,
        }
    }

    pub fn access_count(&self) -> u32 {
        self.access_count.load(Ordering::Relaxed)
    }

    pub fn consecutive_count(&self) -> u32 {
        self.consecutive_count.load(Ordering::Relaxed)
    }

    pub fn is_hot(&self) -> bool {
        self.is_hot.load(Ordering::Relaxed)
    }
}

/// Tunables for the classifier, cached out of `HybridConfig` at
/// construction so hot paths never touch the config object.
#[derive(Debug, Clone)]
pub struct TrackerParams {
    pub capacity: usize,
    pub consecutive_window: Duration,
    pub hot_consecutive_threshold: u32,
    pub hot_absolute_threshold: u32,
    pub promotion_cooldown: Duration,
    pub aging_horizon: Duration,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            capacity: 65_536,
            consecutive_window: Duration::from_millis(50),
            hot_consecutive_threshold: 2,
            hot_absolute_threshold: 5,
            promotion_cooldown: Duration::from_secs(1),
            aging_horizon: Duration::from_millis(250),
        }
    }
}

/// Bounded per-key access tracker.
pub struct AccessTracker {
    stats: AHashMap<u64, KeyStat>,
    params: TrackerParams,
}

impl AccessTracker {
    pub fn new(params: TrackerParams) -> Self {
        Self {
            stats: AHashMap::with_capacity(params.capacity.min(4096)),
            params,
        }
    }

    /// Record one event for `key` and return whether the key now classifies
    /// as hot.
    pub fn note(&mut self, key: u64, _kind: AccessKind) -> bool {
        self.note_at(key, Instant::now())
    }

    /// Test seam: record with an explicit timestamp.
    pub fn note_at(&mut self, key: u64, now: Instant) -> bool {
        if !self.stats.contains_key(&key) && self.stats.len() >= self.params.capacity {
            self.evict_coldest();
        }

        let params = &self.params;
        let stat = self.stats.entry(key).or_insert_with(|| KeyStat::new(now));

        stat.access_count.fetch_add(1, Ordering::Relaxed);
        let within_window = now.duration_since(stat.last_access) < params.consecutive_window;
        let consecutive = if within_window {
            stat.consecutive_count.fetch_add(1, Ordering::Relaxed) + 1
        } else {
            stat.consecutive_count.store(1, Ordering::Relaxed);
            1
        };
        stat.last_access = now;

        let access_count = stat.access_count.load(Ordering::Relaxed);
        let cooled_down = match stat.last_promotion {
            Some(at) => now.duration_since(at) > params.promotion_cooldown,
            None => true,
        };

        consecutive >= params.hot_consecutive_threshold
            || (access_count >= params.hot_absolute_threshold && cooled_down)
    }

    /// Whether the key is currently marked hot (set by a completed
    /// promotion, cleared on rollback).
    pub fn is_hot(&self, key: u64) -> bool {
        self.stats.get(&key).is_some_and(|s| s.is_hot())
    }

    /// Mark a promoted key: sets the hot flag and stamps the promotion time
    /// used by the cooldown check.
    pub fn mark_promoted(&mut self, key: u64, now: Instant) {
        if let Some(stat) = self.stats.get_mut(&key) {
            stat.is_hot.store(true, Ordering::Relaxed);
            stat.last_promotion = Some(now);
        }
    }

    /// Roll back the hot flag after a failed promotion; the key stays in
    /// staging and a later batch may retry.
    pub fn rollback_promotion(&mut self, key: u64) {
        if let Some(stat) = self.stats.get(&key) {
            stat.is_hot.store(false, Ordering::Relaxed);
        }
    }

    /// Remove entries whose last access is older than the aging horizon.
    /// Returns how many were dropped.
    pub fn age_out(&mut self, now: Instant) -> usize {
        let horizon = self.params.aging_horizon;
        let before = self.stats.len();
        self.stats
            .retain(|_, stat| now.duration_since(stat.last_access) <= horizon);
        before - self.stats.len()
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    pub fn get(&self, key: u64) -> Option<&KeyStat> {
        self.stats.get(&key)
    }

    /// Evict the entry with the smallest access count, oldest last access
    /// breaking ties.
    fn evict_coldest(&mut self) {
        let victim = self
            .stats
            .iter()
            .min_by(|(_, a), (_, b)| {
                a.access_count()
                    .cmp(&b.access_count())
                    .then(a.last_access.cmp(&b.last_access))
            })
            .map(|(k, _)| *k);
        if let Some(key) = victim {
            self.stats.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> TrackerParams {
        TrackerParams {
            capacity: 4,
            consecutive_window: Duration::from_millis(50),
            hot_consecutive_threshold: 2,
            hot_absolute_threshold: 5,
            promotion_cooldown: Duration::from_secs(1),
            aging_horizon: Duration::from_millis(250),
        }
    }

    #[test]
    fn test_consecutive_hits_classify_hot() {
        let mut tracker = AccessTracker::new(params());
        let t0 = Instant::now();

        assert!(!tracker.note_at(7, t0));
        // Second access inside the window reaches the consecutive threshold.
        assert!(tracker.note_at(7, t0 + Duration::from_millis(10)));
    }

    #[test]
    fn test_window_gap_resets_consecutive() {
        let mut tracker = AccessTracker::new(params());
        let t0 = Instant::now();

        tracker.note_at(7, t0);
        // Outside the 50ms window: streak restarts at 1.
        assert!(!tracker.note_at(7, t0 + Duration::from_millis(200)));
        assert_eq!(tracker.get(7).unwrap().consecutive_count(), 1);
    }

    #[test]
    fn test_absolute_threshold_classifies_hot() {
        let mut tracker = AccessTracker::new(params());
        let t0 = Instant::now();

        // Spaced accesses never build a streak; the fifth crosses the
        // absolute threshold.
        let mut hot = false;
        for i in 0..5u64 {
            hot = tracker.note_at(9, t0 + Duration::from_millis(i * 100));
        }
        assert!(hot);
    }

    #[test]
    fn test_promotion_cooldown_suppresses_absolute_trigger() {
        let mut tracker = AccessTracker::new(params());
        let t0 = Instant::now();

        for i in 0..5u64 {
            tracker.note_at(9, t0 + Duration::from_millis(i * 100));
        }
        tracker.mark_promoted(9, t0 + Duration::from_millis(500));
        assert!(tracker.is_hot(9));

        // Within the cooldown the absolute rule stays quiet; only a
        // consecutive streak could re-classify.
        assert!(!tracker.note_at(9, t0 + Duration::from_millis(700)));
        // After the cooldown the accumulated count triggers again.
        assert!(tracker.note_at(9, t0 + Duration::from_millis(1700)));
    }

    #[test]
    fn test_rollback_clears_hot_flag() {
        let mut tracker = AccessTracker::new(params());
        let t0 = Instant::now();

        tracker.note_at(3, t0);
        tracker.mark_promoted(3, t0);
        assert!(tracker.is_hot(3));

        tracker.rollback_promotion(3);
        assert!(!tracker.is_hot(3));
    }

    #[test]
    fn test_capacity_evicts_coldest() {
        let mut tracker = AccessTracker::new(params());
        let t0 = Instant::now();

        // Keys 1-4 fill capacity; key 1 gets extra accesses.
        for i in 0..4u64 {
            tracker.note_at(i + 1, t0 + Duration::from_millis(i));
        }
        tracker.note_at(1, t0 + Duration::from_millis(10));

        // Fifth key forces eviction of the coldest (2: count 1, oldest).
        tracker.note_at(5, t0 + Duration::from_millis(20));
        assert_eq!(tracker.len(), 4);
        assert!(tracker.get(2).is_none());
        assert!(tracker.get(1).is_some());
    }

    #[test]
    fn test_age_out() {
        let mut tracker = AccessTracker::new(params());
        let t0 = Instant::now();

        tracker.note_at(1, t0);
        tracker.note_at(2, t0 + Duration::from_millis(300));

        let dropped = tracker.age_out(t0 + Duration::from_millis(400));
        assert_eq!(dropped, 1);
        assert!(tracker.get(1).is_none());
        assert!(tracker.get(2).is_some());
    }

    #[test]
    fn test_bounded_capacity_under_scan() {
        let mut tracker = AccessTracker::new(params());
        let t0 = Instant::now();

        for key in 0..1000u64 {
            tracker.note_at(key, t0 + Duration::from_micros(key));
        }
        assert!(tracker.len() <= 4);
    }
}
