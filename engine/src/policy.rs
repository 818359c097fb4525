//! Migration policy - workload counters and threshold controller
//!
//! Decides *when* the migration engine should run. Three triggers: the
//! staging side outgrew its share of the total (size), the candidate queue
//! reached a full batch (queue), or candidates sat unflushed for too long
//! (staleness). An optional feedback loop nudges the size-ratio threshold
//! toward the current workload mix.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

/// Cumulative workload counters, resettable by the adaptive tick.
///
/// Lock-free: single atomic increment per operation, Relaxed ordering.
#[derive(Debug, Default)]
pub struct WorkloadStats {
    inserts: AtomicU64,
    lookups: AtomicU64,
    migrations: AtomicU64,
}

impl WorkloadStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one insert and return the new cumulative total.
    pub fn record_insert(&self) -> u64 {
        self.inserts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_lookup(&self) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_migration(&self) {
        self.migrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inserts(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }

    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    pub fn migrations(&self) -> u64 {
        self.migrations.load(Ordering::Relaxed)
    }

    /// Reset the mix counters after an adaptive tick. The migration counter
    /// is cumulative for the process lifetime and is left alone.
    fn reset_mix(&self) {
        self.inserts.store(0, Ordering::Relaxed);
        self.lookups.store(0, Ordering::Relaxed);
    }
}

/// Which trigger fired, if any. A size trigger asks for a rebalance (the
/// whole staging side moves); the others promote the queued batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationTrigger {
    /// |S| exceeded its configured share of the total.
    SizeRatio,
    /// The queue holds a full batch.
    QueueFull,
    /// Candidates have been waiting longer than `max_staleness`.
    Staleness,
}

/// Tunables cached out of `HybridConfig`.
#[derive(Debug, Clone)]
pub struct PolicyParams {
    pub migration_threshold: f64,
    pub adaptive: bool,
    pub batch_size: usize,
    pub min_batch: usize,
    pub max_staleness: Duration,
    pub adaptive_tick: Duration,
}

impl Default for PolicyParams {
    fn default() -> Self {
        Self {
            migration_threshold: 0.10,
            adaptive: false,
            batch_size: 1000,
            min_batch: 16,
            max_staleness: Duration::from_millis(500),
            adaptive_tick: Duration::from_millis(100),
        }
    }
}

#[derive(Debug)]
struct PolicyState {
    threshold: f64,
    last_flush: Instant,
    last_tick: Instant,
}

/// Threshold controller. Consulted on the insert stride and by the
/// background worker; cheap enough to sit behind one short-held mutex.
pub struct ThresholdController {
    params: PolicyParams,
    state: Mutex<PolicyState>,
}

impl ThresholdController {
    pub const THRESHOLD_CEIL: f64 = 0.30;
    pub const THRESHOLD_FLOOR_SHRINK: f64 = 0.005;
    pub const THRESHOLD_FLOOR_DRIFT: f64 = 0.01;

    pub fn new(params: PolicyParams) -> Self {
        let now = Instant::now();
        let threshold = params.migration_threshold;
        Self {
            params,
            state: Mutex::new(PolicyState {
                threshold,
                last_flush: now,
                last_tick: now,
            }),
        }
    }

    /// Evaluate the three triggers against the current shape of the hybrid.
    pub fn should_migrate(
        &self,
        staging_len: usize,
        stable_len: usize,
        queue_len: usize,
    ) -> Option<MigrationTrigger> {
        if queue_len >= self.params.batch_size {
            return Some(MigrationTrigger::QueueFull);
        }

        let state = self.state.lock();

        let total = staging_len + stable_len;
        if total > 0 && staging_len as f64 > state.threshold * total as f64 {
            return Some(MigrationTrigger::SizeRatio);
        }

        if queue_len > self.params.min_batch
            && state.last_flush.elapsed() > self.params.max_staleness
        {
            return Some(MigrationTrigger::Staleness);
        }

        None
    }

    /// Record a completed flush for the staleness trigger.
    pub fn note_flush(&self, now: Instant) {
        self.state.lock().last_flush = now;
    }

    /// Current size-ratio threshold (may drift when adaptive).
    pub fn threshold(&self) -> f64 {
        self.state.lock().threshold
    }

    /// Run the adaptive feedback step if enabled and the tick period has
    /// elapsed. Reads the workload mix, nudges the threshold, resets the
    /// mix counters. Returns true when a tick ran.
    pub fn maybe_adapt(&self, stats: &WorkloadStats, now: Instant) -> bool {
        if !self.params.adaptive {
            return false;
        }

        let mut state = self.state.lock();
        if now.duration_since(state.last_tick) < self.params.adaptive_tick {
            return false;
        }
        state.last_tick = now;

        let inserts = stats.inserts();
        let lookups = stats.lookups();
        let total = inserts + lookups;
        if total == 0 {
            return false;
        }

        let insert_ratio = inserts as f64 / total as f64;
        let old = state.threshold;
        state.threshold = if insert_ratio > 0.7 {
            (old * 1.02).min(Self::THRESHOLD_CEIL)
        } else if insert_ratio < 0.3 {
            (old * 0.98).max(Self::THRESHOLD_FLOOR_SHRINK)
        } else {
            (old * 0.99).max(Self::THRESHOLD_FLOOR_DRIFT)
        };

        if (state.threshold - old).abs() > f64::EPSILON {
            debug!(
                insert_ratio,
                old_threshold = old,
                new_threshold = state.threshold,
                "adaptive migration threshold updated"
            );
        }

        stats.reset_mix();
        true
    }
}
