//! Hybrid index façade - routes between the staging and stable sub-indexes
//!
//! One sorted, duplicate-free associative store over two stores with
//! opposite cost profiles. Writes land on the staging side (cheap insert);
//! reads consult the stable side first (cheap lookup) and fall through to
//! staging; the migration machinery moves entries stable-ward as the access
//! pattern warrants.
//!
//! # Read path
//! ```text
//! Lookup -> stable (authoritative) -> staging -> NOT_FOUND
//!                                     |- hit: tracker note, maybe enqueue
//! ```
//!
//! # Write path
//! ```text
//! Insert -> stable  (key is hot or already stable-resident)
//!        -> staging (everything else), policy check every check_period
//! ```
//!
//! Designed for a single writer thread and many reader threads; the
//! background worker (when `async_flush` is set) is the only other thread
//! that mutates the sub-indexes.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::access_tracker::{AccessKind, AccessTracker};
use crate::config::HybridConfig;
use crate::learned_index::LearnedIndex;
use crate::migration::{
    spawn_migration_worker, BatchOutcome, ControlState, MigrationEngine, MigrationQueue,
    WorkerSignal,
};
use crate::policy::{MigrationTrigger, ThresholdController, WorkloadStats};
use crate::staging_index::StagingIndex;
use crate::sub_index::SubIndex;

/// Which sub-index answered a lookup. Instrumentation for tests and
/// diagnostics; the routing rule makes stable authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOrigin {
    Staging,
    Stable,
}

/// Point-in-time view of the hybrid's shape, for logging and tests.
#[derive(Debug, Clone, Default)]
pub struct HybridStats {
    pub staging_len: usize,
    pub stable_len: usize,
    pub tracked_keys: usize,
    pub queued_keys: usize,
    pub inserts: u64,
    pub lookups: u64,
    pub migrations: u64,
    pub migration_threshold: f64,
}

/// The hybrid index, generic over the two sub-index implementations so the
/// lookup hot path monomorphizes per configuration.
pub struct HybridIndex<S: SubIndex, L: SubIndex> {
    staging: Arc<RwLock<S>>,
    stable: Arc<RwLock<L>>,
    control: Arc<Mutex<ControlState>>,
    controller: Arc<ThresholdController>,
    stats: Arc<WorkloadStats>,
    engine: Arc<MigrationEngine<S, L>>,
    signal: Option<Arc<WorkerSignal>>,
    worker: Option<JoinHandle<()>>,

    /// Policy evaluation guard: inserts try-lock this and skip the check on
    /// contention, so the write path never stalls behind a slow decision.
    policy_check: Mutex<()>,

    // Config fields cached so hot paths never read the config object.
    check_period: u64,
    config: HybridConfig,
}

/// The default pairing: BTree-backed staging, segmented learned stable.
pub type StagedIndex = HybridIndex<StagingIndex, LearnedIndex>;

impl StagedIndex {
    /// Construct the default hybrid from configuration.
    pub fn new(config: HybridConfig) -> Result<Self> {
        let stable_segment_size = config.stable_segment_size;
        Self::with_indexes(
            config,
            StagingIndex::new(),
            LearnedIndex::new(stable_segment_size),
        )
    }
}

impl<S, L> HybridIndex<S, L>
where
    S: SubIndex + 'static,
    L: SubIndex + 'static,
{
    /// Construct a hybrid over caller-supplied sub-indexes. Normalizes and
    /// validates the configuration, then (when `async_flush` is set) spawns
    /// the migration worker.
    pub fn with_indexes(config: HybridConfig, staging: S, stable: L) -> Result<Self> {
        let config = config.normalized();
        config.validate().context("invalid hybrid configuration")?;

        let staging = Arc::new(RwLock::new(staging));
        let stable = Arc::new(RwLock::new(stable));
        let control = Arc::new(Mutex::new(ControlState {
            tracker: AccessTracker::new(config.tracker_params()),
            queue: MigrationQueue::new(),
        }));
        let controller = Arc::new(ThresholdController::new(config.policy_params()));
        let stats = Arc::new(WorkloadStats::new());

        let engine = Arc::new(MigrationEngine::new(
            staging.clone(),
            stable.clone(),
            control.clone(),
            controller.clone(),
            stats.clone(),
        ));

        let (signal, worker) = if config.async_flush {
            let signal = Arc::new(WorkerSignal::new());
            let worker =
                spawn_migration_worker(engine.clone(), signal.clone(), config.adaptive_tick());
            (Some(signal), Some(worker))
        } else {
            (None, None)
        };

        Ok(Self {
            staging,
            stable,
            control,
            controller,
            stats,
            engine,
            signal,
            worker,
            policy_check: Mutex::new(()),
            check_period: config.check_period,
            config,
        })
    }

    /// Bulk-load `entries` into the stable side. Input need not be sorted;
    /// duplicate keys resolve last-writer-wins. Returns the elapsed build
    /// time. On failure nothing is loaded.
    pub fn build(&self, mut entries: Vec<(u64, u64)>, parallelism: usize) -> Result<Duration> {
        let start = Instant::now();

        sort_entries(&mut entries, parallelism);
        let entries = dedup_last_writer(entries);

        self.stable
            .write()
            .build_bulk(&entries)
            .context("bulk build of stable sub-index failed")?;
        self.staging.write().build_bulk(&[])?;
        self.control.lock().queue.drain();

        Ok(start.elapsed())
    }

    /// Point lookup. `None` is the NOT_FOUND sentinel.
    pub fn lookup(&self, key: u64) -> Option<u64> {
        self.lookup_with_origin(key).map(|(value, _)| value)
    }

    /// Point lookup that also reports which sub-index answered.
    pub fn lookup_with_origin(&self, key: u64) -> Option<(u64, IndexOrigin)> {
        self.stats.record_lookup();

        let stable_hit = self.stable.read().lookup(key);
        if let Some(value) = stable_hit {
            #[cfg(debug_assertions)]
            self.verify_routing_invariant(key, value);

            self.control.lock().tracker.note(key, AccessKind::HitStable);
            return Some((value, IndexOrigin::Stable));
        }

        let staging_hit = self.staging.read().lookup(key);
        if let Some(value) = staging_hit {
            let mut control = self.control.lock();
            if control.tracker.note(key, AccessKind::HitStaging) && control.queue.push(key) {
                trace!(key, "hot key enqueued for promotion");
            }
            return Some((value, IndexOrigin::Staging));
        }

        // Both sides missed. A promotion may have raced between the two
        // reads (stable miss before the insert, staging miss after the
        // evict); keys only ever move staging -> stable, so one stable
        // re-check closes that window.
        let promoted_hit = self.stable.read().lookup(key);
        if let Some(value) = promoted_hit {
            self.control.lock().tracker.note(key, AccessKind::HitStable);
            return Some((value, IndexOrigin::Stable));
        }

        None
    }

    /// Insert an entry. Hot or stable-resident keys overwrite in place on
    /// the stable side; everything else goes to staging. Every
    /// `check_period` inserts the migration policy is evaluated.
    pub fn insert(&self, key: u64, value: u64) -> Result<()> {
        let is_hot = self.control.lock().tracker.is_hot(key);
        {
            // The staging write lock is taken before the residency check so
            // a concurrent batch cannot evict the key between the routing
            // decision and the write (staging before stable, the global
            // lock order).
            let mut staging = self.staging.write();
            let stable_resident = !is_hot && self.stable.read().lookup(key).is_some();
            if is_hot || stable_resident {
                drop(staging);
                self.stable.write().insert(key, value)?;
            } else {
                staging.insert(key, value)?;
            }
        }

        self.control.lock().tracker.note(key, AccessKind::Insert);

        let count = self.stats.record_insert();
        if count % self.check_period == 0 {
            self.evaluate_policy();
        }
        Ok(())
    }

    /// Count of keys in the inclusive range `[lo, hi]` across both sides.
    /// Runs outside any promote window so no key is double-counted.
    pub fn range_count(&self, lo: u64, hi: u64) -> usize {
        let _window = self.engine.window_mutex().lock();
        let staging = self.staging.read();
        let stable = self.stable.read();
        stable.range_count(lo, hi) + staging.range_count(lo, hi)
    }

    /// Entries in the inclusive range `[lo, hi]`, ascending, stable-side
    /// values winning on any overlap.
    pub fn range_query(&self, lo: u64, hi: u64) -> Vec<(u64, u64)> {
        let _window = self.engine.window_mutex().lock();
        let staging_entries = self.staging.read().range_entries(lo, hi);
        let stable_entries = self.stable.read().range_entries(lo, hi);
        merge_stable_first(stable_entries, staging_entries)
    }

    /// Total number of entries.
    pub fn size(&self) -> usize {
        let _window = self.engine.window_mutex().lock();
        let staging = self.staging.read();
        let stable = self.stable.read();
        staging.len() + stable.len()
    }

    /// Sorted snapshot of every entry across both sides.
    pub fn export_entries(&self) -> Vec<(u64, u64)> {
        self.range_query(0, u64::MAX)
    }

    /// Run one migration batch on the calling thread, regardless of the
    /// `async_flush` setting. Returns `None` when a batch was already in
    /// flight.
    pub fn migrate_now(&self) -> Option<BatchOutcome> {
        self.engine.run(MigrationTrigger::QueueFull)
    }

    /// Identifier for logs and reports.
    pub fn name(&self) -> &'static str {
        "hybrid_staged_learned"
    }

    /// Configuration fingerprint for logs and reports.
    pub fn variant(&self) -> String {
        format!(
            "mt={:.3},batch={},adaptive={},async={}",
            self.config.migration_threshold,
            self.config.batch_size,
            self.config.adaptive_threshold,
            self.config.async_flush,
        )
    }

    /// Current shape and counters.
    pub fn stats(&self) -> HybridStats {
        let (tracked_keys, queued_keys) = {
            let control = self.control.lock();
            (control.tracker.len(), control.queue.len())
        };
        HybridStats {
            staging_len: self.staging.read().len(),
            stable_len: self.stable.read().len(),
            tracked_keys,
            queued_keys,
            inserts: self.stats.inserts(),
            lookups: self.stats.lookups(),
            migrations: self.stats.migrations(),
            migration_threshold: self.controller.threshold(),
        }
    }

    /// Evaluate the migration policy under the try-lock; skipped entirely
    /// when another thread is already deciding.
    fn evaluate_policy(&self) {
        let Some(_guard) = self.policy_check.try_lock() else {
            return;
        };

        self.engine.tick(Instant::now());

        let staging_len = self.staging.read().len();
        let stable_len = self.stable.read().len();
        let queue_len = self.control.lock().queue.len();

        if let Some(trigger) = self
            .controller
            .should_migrate(staging_len, stable_len, queue_len)
        {
            self.start_migration(trigger);
        }
    }

    fn start_migration(&self, trigger: MigrationTrigger) {
        match &self.signal {
            Some(signal) => signal.request(trigger),
            None => {
                self.engine.run(trigger);
            }
        }
    }

    /// Debug-only cross-check of invariant: a stable hit must not shadow a
    /// different staged value. Cannot arise under correct migration.
    #[cfg(debug_assertions)]
    fn verify_routing_invariant(&self, key: u64, stable_value: u64) {
        if let Some(staged) = self.staging.read().lookup(key) {
            if staged != stable_value {
                tracing::error!(
                    key,
                    stable_value,
                    staged_value = staged,
                    "routing invariant violation: key resident on both sides, \
                     stable value treated as authoritative"
                );
            }
        }
    }
}

impl<S: SubIndex, L: SubIndex> Drop for HybridIndex<S, L> {
    /// Shutdown drains: signal the worker, let any pending batch finish,
    /// join. Never detach.
    fn drop(&mut self) {
        if let Some(signal) = &self.signal {
            signal.stop();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Stable sort by key; chunked across scoped threads when the caller asked
/// for parallelism and the input is large enough to be worth it.
fn sort_entries(entries: &mut Vec<(u64, u64)>, parallelism: usize) {
    let threads = parallelism.max(1);
    if threads == 1 || entries.len() < 4096 {
        entries.sort_by_key(|(k, _)| *k);
        return;
    }

    let chunk_len = entries.len().div_ceil(threads);
    let mut chunks: Vec<Vec<(u64, u64)>> = entries.chunks(chunk_len).map(<[_]>::to_vec).collect();
    std::thread::scope(|scope| {
        for chunk in chunks.iter_mut() {
            scope.spawn(move || chunk.sort_by_key(|(k, _)| *k));
        }
    });
    *entries = merge_sorted_chunks(chunks);
}

/// Pairwise merge keeps earlier chunks first on ties, preserving the
/// stability last-writer-wins dedup relies on.
fn merge_sorted_chunks(mut chunks: Vec<Vec<(u64, u64)>>) -> Vec<(u64, u64)> {
    while chunks.len() > 1 {
        let mut next = Vec::with_capacity(chunks.len().div_ceil(2));
        let mut iter = chunks.into_iter();
        while let Some(a) = iter.next() {
            match iter.next() {
                Some(b) => next.push(merge_two(a, b)),
                None => next.push(a),
            }
        }
        chunks = next;
    }
    chunks.pop().unwrap_or_default()
}

fn merge_two(a: Vec<(u64, u64)>, b: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut ia, mut ib) = (a.into_iter().peekable(), b.into_iter().peekable());
    loop {
        match (ia.peek(), ib.peek()) {
            (Some(x), Some(y)) => {
                if x.0 <= y.0 {
                    out.push(ia.next().unwrap());
                } else {
                    out.push(ib.next().unwrap());
                }
            }
            (Some(_), None) => out.push(ia.next().unwrap()),
            (None, Some(_)) => out.push(ib.next().unwrap()),
            (None, None) => break,
        }
    }
    out
}

/// Collapse a sorted run to one entry per key, keeping the last occurrence.
fn dedup_last_writer(entries: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    let mut out: Vec<(u64, u64)> = Vec::with_capacity(entries.len());
    for entry in entries {
        match out.last_mut() {
            Some(last) if last.0 == entry.0 => *last = entry,
            _ => out.push(entry),
        }
    }
    out
}

/// Merge two sorted runs, preferring the first (stable) side on key ties.
fn merge_stable_first(stable: Vec<(u64, u64)>, staging: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    let mut out = Vec::with_capacity(stable.len() + staging.len());
    let (mut is_, mut ig) = (stable.into_iter().peekable(), staging.into_iter().peekable());
    loop {
        match (is_.peek(), ig.peek()) {
            (Some(x), Some(y)) => {
                if x.0 < y.0 {
                    out.push(is_.next().unwrap());
                } else if y.0 < x.0 {
                    out.push(ig.next().unwrap());
                } else {
                    out.push(is_.next().unwrap());
                    ig.next();
                }
            }
            (Some(_), None) => out.push(is_.next().unwrap()),
            (None, Some(_)) => out.push(ig.next().unwrap()),
            (None, None) => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hybrid(config: HybridConfig) -> StagedIndex {
        StagedIndex::new(config).unwrap()
    }

    #[test]
    fn test_build_and_lookup() {
        let idx = hybrid(HybridConfig::default());
        idx.build(vec![(1, 10), (2, 20), (3, 30)], 1).unwrap();

        assert_eq!(idx.lookup(2), Some(20));
        assert_eq!(idx.lookup(4), None);
        assert_eq!(idx.size(), 3);
    }

    #[test]
    fn test_build_unsorted_with_duplicates_last_writer_wins() {
        let idx = hybrid(HybridConfig::default());
        idx.build(vec![(5, 1), (2, 2), (5, 3), (1, 4), (5, 5)], 1)
            .unwrap();

        assert_eq!(idx.size(), 3);
        assert_eq!(idx.lookup(5), Some(5));
        assert_eq!(idx.lookup(1), Some(4));
    }

    #[test]
    fn test_build_parallel_matches_sequential() {
        let entries: Vec<(u64, u64)> = (0..20_000u64).rev().map(|k| (k, k * 3)).collect();

        let seq = hybrid(HybridConfig::default());
        seq.build(entries.clone(), 1).unwrap();
        let par = hybrid(HybridConfig::default());
        par.build(entries, 4).unwrap();

        assert_eq!(seq.size(), par.size());
        for k in (0..20_000u64).step_by(997) {
            assert_eq!(seq.lookup(k), par.lookup(k));
        }
    }

    #[test]
    fn test_insert_routes_to_staging() {
        let idx = hybrid(HybridConfig::default());
        idx.insert(100, 1).unwrap();
        idx.insert(50, 2).unwrap();

        assert_eq!(idx.size(), 2);
        assert_eq!(idx.lookup(50), Some(2));
        assert_eq!(idx.lookup_with_origin(100).unwrap().1, IndexOrigin::Staging);
        assert_eq!(idx.stats().migrations, 0);
    }

    #[test]
    fn test_insert_overwrites_stable_resident_key() {
        let idx = hybrid(HybridConfig::default());
        idx.build(vec![(7, 70)], 1).unwrap();

        // The key lives on the stable side; a cold re-insert must not
        // shadow it with a staged duplicate.
        idx.insert(7, 71).unwrap();
        assert_eq!(idx.lookup(7), Some(71));
        assert_eq!(idx.size(), 1);
        assert_eq!(idx.lookup_with_origin(7).unwrap().1, IndexOrigin::Stable);
    }

    #[test]
    fn test_hot_key_promotes_on_manual_migration() {
        let cfg = HybridConfig {
            consecutive_window_ms: 1000,
            ..Default::default()
        };
        let idx = hybrid(cfg);

        idx.insert(7, 70).unwrap();
        assert_eq!(idx.lookup(7), Some(70));
        assert_eq!(idx.lookup(7), Some(70));

        let outcome = idx.migrate_now().unwrap();
        assert_eq!(outcome.promoted, 1);

        let (value, origin) = idx.lookup_with_origin(7).unwrap();
        assert_eq!(value, 70);
        assert_eq!(origin, IndexOrigin::Stable);
        assert_eq!(idx.size(), 1);
    }

    #[test]
    fn test_hot_key_insert_routes_to_stable() {
        let cfg = HybridConfig {
            consecutive_window_ms: 1000,
            ..Default::default()
        };
        let idx = hybrid(cfg);

        idx.insert(9, 90).unwrap();
        idx.lookup(9);
        idx.lookup(9);
        idx.migrate_now().unwrap();

        idx.insert(9, 91).unwrap();
        assert_eq!(idx.lookup_with_origin(9), Some((91, IndexOrigin::Stable)));
        assert_eq!(idx.size(), 1);
    }

    #[test]
    fn test_size_ratio_migration_keeps_staging_bounded() {
        let cfg = HybridConfig {
            migration_threshold: 0.10,
            check_period: 10,
            ..Default::default()
        };
        let idx = hybrid(cfg);

        for k in 1..=1000u64 {
            idx.insert(k, k).unwrap();
        }

        let stats = idx.stats();
        assert!(stats.migrations >= 1);
        assert!(
            stats.staging_len as f64 <= 0.10 * idx.size() as f64 + 10.0,
            "staging still holds {} of {}",
            stats.staging_len,
            idx.size()
        );
        for k in (1..=1000u64).step_by(37) {
            assert_eq!(idx.lookup(k), Some(k));
        }
    }

    #[test]
    fn test_range_count_spans_both_sides() {
        let cfg = HybridConfig {
            // High threshold so staged entries stay staged.
            migration_threshold: 0.99,
            ..Default::default()
        };
        let idx = hybrid(cfg);
        idx.build(vec![(1, 1), (2, 2), (3, 3)], 1).unwrap();
        idx.insert(10, 10).unwrap();
        idx.insert(11, 11).unwrap();

        assert_eq!(idx.range_count(1, 11), 5);
        assert_eq!(idx.range_count(3, 10), 2);
        assert_eq!(idx.range_count(11, 3), 0);
    }

    #[test]
    fn test_range_query_merges_sorted() {
        let cfg = HybridConfig {
            migration_threshold: 0.99,
            ..Default::default()
        };
        let idx = hybrid(cfg);
        idx.build(vec![(2, 20), (4, 40)], 1).unwrap();
        idx.insert(1, 10).unwrap();
        idx.insert(3, 30).unwrap();

        assert_eq!(
            idx.range_query(1, 4),
            vec![(1, 10), (2, 20), (3, 30), (4, 40)]
        );
    }

    #[test]
    fn test_export_entries_round_trips() {
        let cfg = HybridConfig {
            migration_threshold: 0.99,
            ..Default::default()
        };
        let idx = hybrid(cfg);
        idx.build(vec![(5, 50), (6, 60)], 1).unwrap();
        idx.insert(1, 10).unwrap();

        let snapshot = idx.export_entries();
        assert_eq!(snapshot, vec![(1, 10), (5, 50), (6, 60)]);

        let rebuilt = hybrid(HybridConfig::default());
        rebuilt.build(snapshot, 1).unwrap();
        assert_eq!(rebuilt.size(), 3);
        assert_eq!(rebuilt.lookup(6), Some(60));
    }

    #[test]
    fn test_lookup_is_idempotent() {
        let idx = hybrid(HybridConfig::default());
        idx.build(vec![(1, 10)], 1).unwrap();
        idx.insert(2, 20).unwrap();

        for _ in 0..10 {
            assert_eq!(idx.lookup(1), Some(10));
            assert_eq!(idx.lookup(2), Some(20));
            assert_eq!(idx.lookup(3), None);
        }
        assert_eq!(idx.size(), 2);
    }

    #[test]
    fn test_name_and_variant() {
        let idx = hybrid(HybridConfig::default());
        assert_eq!(idx.name(), "hybrid_staged_learned");
        assert!(idx.variant().contains("mt=0.100"));
        assert!(idx.variant().contains("batch=1000"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let cfg = HybridConfig {
            migration_threshold: -0.5,
            ..Default::default()
        };
        assert!(StagedIndex::new(cfg).is_err());
    }

    #[test]
    fn test_percent_config_accepted() {
        let cfg = HybridConfig {
            migration_threshold: 15.0,
            ..Default::default()
        };
        let idx = StagedIndex::new(cfg).unwrap();
        assert!(idx.variant().contains("mt=0.150"));
    }
}
