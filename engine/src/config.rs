// engine/src/config.rs
//
// Construction-time configuration for the hybrid index.
//
// A single value, validated once, immutable afterwards. The façade caches
// every field it needs into plain struct fields at construction; hot paths
// never read through this object.

use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::access_tracker::TrackerParams;
use crate::policy::PolicyParams;

/// Tunables for the hybrid index. Durations are carried as integer
/// milliseconds so the struct embeds cleanly in host-application config
/// files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HybridConfig {
    /// Size-ratio migration trigger: migrate when |staging| exceeds this
    /// share of the total. A value above 1 is read as a percentage.
    pub migration_threshold: f64,

    /// Enable the feedback loop that drifts `migration_threshold` with the
    /// observed insert/lookup mix.
    pub adaptive_threshold: bool,

    /// Queue-length migration trigger.
    pub batch_size: usize,

    /// Minimum queue length before the staleness trigger may fire.
    pub min_batch: usize,

    /// Insert-count stride between policy evaluations.
    pub check_period: u64,

    /// Consecutive accesses inside the window that classify a key as hot.
    pub hot_consecutive_threshold: u32,

    /// Total accesses that classify a key as hot (outside the cooldown).
    pub hot_absolute_threshold: u32,

    /// Window for counting accesses as consecutive.
    pub consecutive_window_ms: u64,

    /// Minimum gap between re-promotions of the same key.
    pub promotion_cooldown_ms: u64,

    /// Tracker entries idle longer than this are aged out.
    pub aging_horizon_ms: u64,

    /// Queued candidates older than this trip the staleness trigger.
    pub max_staleness_ms: u64,

    /// Upper bound on tracked keys (M).
    pub tracker_capacity: usize,

    /// Run migrations on the background worker instead of the calling
    /// thread.
    pub async_flush: bool,

    /// Adaptive feedback tick period.
    pub adaptive_tick_ms: u64,

    /// Segment granularity for the stable side's bulk build.
    pub stable_segment_size: usize,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            migration_threshold: 0.10,
            adaptive_threshold: false,
            batch_size: 1000,
            min_batch: 16,
            check_period: 100,
            hot_consecutive_threshold: 2,
            hot_absolute_threshold: 5,
            consecutive_window_ms: 50,
            promotion_cooldown_ms: 1000,
            aging_horizon_ms: 250,
            max_staleness_ms: 500,
            tracker_capacity: 65_536,
            async_flush: false,
            adaptive_tick_ms: 100,
            stable_segment_size: 1024,
        }
    }
}

impl HybridConfig {
    /// Normalize percent-style thresholds (legacy integer parameters in
    /// 0..100) into the canonical (0, 1] ratio.
    pub fn normalized(mut self) -> Self {
        if self.migration_threshold > 1.0 {
            self.migration_threshold /= 100.0;
        }
        self
    }

    /// Validate after normalization. Rejects configurations the policy or
    /// the sub-indexes cannot honor.
    pub fn validate(&self) -> Result<()> {
        if !(self.migration_threshold > 0.0 && self.migration_threshold <= 1.0) {
            bail!(
                "migration_threshold must be in (0, 1], got {}",
                self.migration_threshold
            );
        }
        if self.batch_size == 0 {
            bail!("batch_size must be positive");
        }
        if self.min_batch > self.batch_size {
            bail!(
                "min_batch ({}) must not exceed batch_size ({})",
                self.min_batch,
                self.batch_size
            );
        }
        if self.check_period == 0 {
            bail!("check_period must be positive");
        }
        if self.tracker_capacity == 0 {
            bail!("tracker_capacity must be positive");
        }
        if self.stable_segment_size == 0 {
            bail!("stable_segment_size must be positive");
        }
        if self.hot_consecutive_threshold == 0 || self.hot_absolute_threshold == 0 {
            bail!("hot-key thresholds must be positive");
        }
        Ok(())
    }

    pub fn consecutive_window(&self) -> Duration {
        Duration::from_millis(self.consecutive_window_ms)
    }

    pub fn promotion_cooldown(&self) -> Duration {
        Duration::from_millis(self.promotion_cooldown_ms)
    }

    pub fn aging_horizon(&self) -> Duration {
        Duration::from_millis(self.aging_horizon_ms)
    }

    pub fn max_staleness(&self) -> Duration {
        Duration::from_millis(self.max_staleness_ms)
    }

    pub fn adaptive_tick(&self) -> Duration {
        Duration::from_millis(self.adaptive_tick_ms)
    }

    pub(crate) fn tracker_params(&self) -> TrackerParams {
        TrackerParams {
            capacity: self.tracker_capacity,
            consecutive_window: self.consecutive_window(),
            hot_consecutive_threshold: self.hot_consecutive_threshold,
            hot_absolute_threshold: self.hot_absolute_threshold,
            promotion_cooldown: self.promotion_cooldown(),
            aging_horizon: self.aging_horizon(),
        }
    }

    pub(crate) fn policy_params(&self) -> PolicyParams {
        PolicyParams {
            migration_threshold: self.migration_threshold,
            adaptive: self.adaptive_threshold,
            batch_size: self.batch_size,
            min_batch: self.min_batch,
            max_staleness: self.max_staleness(),
            adaptive_tick: self.adaptive_tick(),
        }
    }
}
