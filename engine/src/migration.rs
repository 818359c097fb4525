//! Migration - candidate queue, batched promotion engine, background worker
//!
//! Promotion moves entries from the staging side to the stable side in
//! batches: drain the candidate queue, resolve survivors against staging,
//! sort, bulk-load or insert into stable, evict from staging, mark the
//! tracker. At most one batch is in flight per hybrid instance, enforced by
//! an acquire/release atomic; the promote window additionally holds the
//! migration mutex so range operations never observe a key on both sides.
//!
//! Failures are best-effort: a key whose promotion fails keeps its staging
//! copy, has its hot flag rolled back, and may be retried by a later batch.
//! Nothing is surfaced to callers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ahash::AHashSet;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::access_tracker::AccessTracker;
use crate::policy::{MigrationTrigger, ThresholdController, WorkloadStats};
use crate::sub_index::SubIndex;

/// Ordered multiset of promotion candidates with set semantics: a key is
/// held at most once, duplicates are rejected silently, iteration order is
/// insertion order.
#[derive(Debug, Default)]
pub struct MigrationQueue {
    order: VecDeque<u64>,
    members: AHashSet<u64>,
}

impl MigrationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a candidate. Returns false when the key is already queued.
    pub fn push(&mut self, key: u64) -> bool {
        if !self.members.insert(key) {
            return false;
        }
        self.order.push_back(key);
        true
    }

    pub fn contains(&self, key: u64) -> bool {
        self.members.contains(&key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Atomically transfer the contents out, leaving the queue empty.
    pub fn drain(&mut self) -> Vec<u64> {
        self.members.clear();
        self.order.drain(..).collect()
    }
}

/// Tracker and queue share one control mutex (held briefly on hot paths).
pub struct ControlState {
    pub tracker: AccessTracker,
    pub queue: MigrationQueue,
}

/// Outcome of one batch, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub drained: usize,
    pub promoted: usize,
    pub failed: usize,
}

/// Batched promotion engine. Shared between the façade (synchronous
/// migrations) and the background worker (asynchronous migrations).
pub struct MigrationEngine<S, L> {
    staging: Arc<RwLock<S>>,
    stable: Arc<RwLock<L>>,
    control: Arc<Mutex<ControlState>>,
    controller: Arc<ThresholdController>,
    stats: Arc<WorkloadStats>,
    in_progress: AtomicBool,
    window: Mutex<()>,
}

impl<S: SubIndex, L: SubIndex> MigrationEngine<S, L> {
    pub fn new(
        staging: Arc<RwLock<S>>,
        stable: Arc<RwLock<L>>,
        control: Arc<Mutex<ControlState>>,
        controller: Arc<ThresholdController>,
        stats: Arc<WorkloadStats>,
    ) -> Self {
        Self {
            staging,
            stable,
            control,
            controller,
            stats,
            in_progress: AtomicBool::new(false),
            window: Mutex::new(()),
        }
    }

    /// Mutex excluding range operations from the critical promote window.
    /// Lookups are never excluded.
    pub fn window_mutex(&self) -> &Mutex<()> {
        &self.window
    }

    /// Run one batch for `trigger`. Returns `None` when another batch was
    /// already in flight (a second start is a no-op).
    pub fn run(&self, trigger: MigrationTrigger) -> Option<BatchOutcome> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            trace!(?trigger, "migration already in flight, skipping");
            return None;
        }

        let outcome = {
            let _window = self.window.lock();
            self.run_batch(trigger)
        };

        self.in_progress.store(false, Ordering::Release);
        Some(outcome)
    }

    /// Periodic maintenance: adaptive threshold tick and tracker aging.
    /// Driven by the worker's wait timeout in async mode and by the policy
    /// stride in synchronous mode.
    pub fn tick(&self, now: Instant) {
        self.controller.maybe_adapt(&self.stats, now);
        let aged = self.control.lock().tracker.age_out(now);
        if aged > 0 {
            trace!(aged, "tracker aging sweep");
        }
    }

    fn run_batch(&self, trigger: MigrationTrigger) -> BatchOutcome {
        // Drain: snapshot the queue and clear it.
        let mut keys = self.control.lock().queue.drain();
        let drained = keys.len();

        // A size-ratio trigger rebalances by taking the whole staging side
        // along with the queued candidates.
        if trigger == MigrationTrigger::SizeRatio {
            let staging = self.staging.read();
            keys.extend(staging.range_entries(0, u64::MAX).into_iter().map(|(k, _)| k));
        }

        if keys.is_empty() {
            self.controller.note_flush(Instant::now());
            debug!(?trigger, drained, "migration batch had no candidates");
            return BatchOutcome {
                drained,
                ..BatchOutcome::default()
            };
        }

        // Sort ascending; queue candidates and rebalance keys can overlap,
        // so collapse duplicates.
        keys.sort_unstable();
        keys.dedup();

        // Resolve + promote: values are read under a staging read guard
        // held across the stable mutation, so the writer (which takes the
        // staging write lock first) cannot overwrite a key while its value
        // is in flight. Keys missing from staging were already migrated.
        let (promoted, mut failed) = self.promote(&keys);

        if promoted.is_empty() && failed.is_empty() {
            self.controller.note_flush(Instant::now());
            debug!(?trigger, drained, "migration batch had no survivors");
            return BatchOutcome {
                drained,
                ..BatchOutcome::default()
            };
        }

        // Evict promoted keys from staging. The writer may have overwritten
        // a key after the resolve snapshot, so the staged value is
        // re-checked under both write locks (staging acquired first,
        // matching the façade's order) and a newer value is carried
        // forward instead of being clobbered.
        let mut evicted: Vec<u64> = Vec::with_capacity(promoted.len());
        if !promoted.is_empty() {
            let mut staging = self.staging.write();
            let mut stable = self.stable.write();
            for (key, value) in &promoted {
                match staging.lookup(*key) {
                    Some(current) if current != *value => {
                        match stable.insert(*key, current) {
                            Ok(()) => {
                                staging.remove(*key);
                                evicted.push(*key);
                            }
                            Err(err) => {
                                warn!(key, error = %err, "carry-forward failed, demoting key");
                                // Unshadow the staged copy so it stays
                                // authoritative.
                                stable.remove(*key);
                                failed.push(*key);
                            }
                        }
                    }
                    _ => {
                        staging.remove(*key);
                        evicted.push(*key);
                    }
                }
            }
        }

        // Mark: hot flag + promotion stamp for winners, rollback for losers.
        let now = Instant::now();
        {
            let mut control = self.control.lock();
            for key in &evicted {
                control.tracker.mark_promoted(*key, now);
            }
            for key in &failed {
                control.tracker.rollback_promotion(*key);
            }
        }

        if !evicted.is_empty() {
            self.stats.record_migration();
        }
        self.controller.note_flush(now);

        info!(
            ?trigger,
            drained,
            batch = keys.len(),
            promoted = evicted.len(),
            failed = failed.len(),
            "migration batch complete"
        );

        BatchOutcome {
            drained,
            promoted: evicted.len(),
            failed: failed.len(),
        }
    }

    /// Resolve the sorted candidate keys against staging and move the
    /// surviving pairs into stable: one bulk build when stable is empty or
    /// dwarfed by the batch, per-key inserts otherwise.
    fn promote(&self, keys: &[u64]) -> (Vec<(u64, u64)>, Vec<u64>) {
        let staging = self.staging.read();
        let mut stable = self.stable.write();

        let batch: Vec<(u64, u64)> = keys
            .iter()
            .filter_map(|key| staging.lookup(*key).map(|value| (*key, value)))
            .collect();
        if batch.is_empty() {
            return (Vec::new(), Vec::new());
        }

        if stable.is_empty() {
            return match stable.build_bulk(&batch) {
                Ok(()) => (batch, Vec::new()),
                Err(err) => {
                    warn!(error = %err, "bulk promotion failed, keys stay staged");
                    (Vec::new(), batch.iter().map(|(k, _)| *k).collect())
                }
            };
        }

        if stable.len() * 4 <= batch.len() {
            // Stable is dwarfed by the batch: merge and rebuild in one pass.
            // On a key collision stable stays authoritative.
            let mut merged = stable.range_entries(0, u64::MAX);
            merged.extend_from_slice(&batch);
            merged.sort_by_key(|(k, _)| *k);
            merged.dedup_by_key(|(k, _)| *k);
            return match stable.build_bulk(&merged) {
                Ok(()) => (batch, Vec::new()),
                Err(err) => {
                    warn!(error = %err, "merge rebuild failed, keys stay staged");
                    (Vec::new(), batch.iter().map(|(k, _)| *k).collect())
                }
            };
        }

        let mut promoted = Vec::with_capacity(batch.len());
        let mut failed = Vec::new();
        for (key, value) in &batch {
            match stable.insert(*key, *value) {
                Ok(()) => promoted.push((*key, *value)),
                Err(err) => {
                    warn!(key, error = %err, "promotion failed, key stays staged");
                    failed.push(*key);
                }
            }
        }
        (promoted, failed)
    }
}

/// Wakeup channel between the façade and the background worker.
pub struct WorkerSignal {
    state: Mutex<WorkerState>,
    cv: Condvar,
}

struct WorkerState {
    stop: bool,
    pending: Option<MigrationTrigger>,
}

impl WorkerSignal {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WorkerState {
                stop: false,
                pending: None,
            }),
            cv: Condvar::new(),
        }
    }

    /// Ask the worker to run one batch. A size-ratio request supersedes a
    /// queued drain request, never the other way around.
    pub fn request(&self, trigger: MigrationTrigger) {
        let mut state = self.state.lock();
        state.pending = match state.pending {
            Some(MigrationTrigger::SizeRatio) => Some(MigrationTrigger::SizeRatio),
            _ => Some(trigger),
        };
        self.cv.notify_one();
    }

    /// Signal shutdown. Any pending request is still serviced first.
    pub fn stop(&self) {
        self.state.lock().stop = true;
        self.cv.notify_one();
    }
}

impl Default for WorkerSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the long-lived migration worker. It parks on the condition
/// variable with a bounded timeout so the adaptive tick and tracker aging
/// keep running even without migration requests, services one batch per
/// wakeup, and exits once `stop` is set and no request is pending.
pub fn spawn_migration_worker<S, L>(
    engine: Arc<MigrationEngine<S, L>>,
    signal: Arc<WorkerSignal>,
    tick: Duration,
) -> JoinHandle<()>
where
    S: SubIndex + 'static,
    L: SubIndex + 'static,
{
    std::thread::spawn(move || {
        debug!("migration worker started");
        loop {
            let pending = {
                let mut state = signal.state.lock();
                if state.pending.is_none() && !state.stop {
                    signal.cv.wait_for(&mut state, tick);
                }
                if state.stop && state.pending.is_none() {
                    break;
                }
                state.pending.take()
            };

            engine.tick(Instant::now());
            if let Some(trigger) = pending {
                engine.run(trigger);
            }
        }
        debug!("migration worker stopped");
    })
}
