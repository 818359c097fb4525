//! stratakv - hybrid staged/learned index for 64-bit keys
//!
//! One ordered, duplicate-free key→value store composed from two ordered
//! sub-indexes with opposite cost profiles: a write-optimized staging side
//! and a bulk-built, read-optimized stable side. Entries migrate from
//! staging to stable in batches as access patterns evolve, so lookup cost
//! tends toward the stable side for hot and long-lived keys while insert
//! cost stays on the staging side.
//!
//! Built for a single writer thread and many reader threads; the optional
//! background worker that executes migrations is owned by the index and
//! joined on drop.

// ===== Core modules =====

// Sub-index adapter contract shared by both sides
pub mod sub_index;

// Staging side: write-optimized ordered store
pub mod staging_index;

// Stable side: segmented learned index, bulk-built
pub mod learned_index;

// Hot/cold classification: bounded per-key access statistics
pub mod access_tracker;

// Migration: candidate queue, batch promotion engine, background worker
pub mod migration;

// Policy: workload counters + migration threshold controller
pub mod policy;

// Façade: routing, invariants, public operations
pub mod hybrid_index;

// Configuration management: validated construction-time tunables
pub mod config;

// ===== Public API =====

pub use access_tracker::{AccessKind, AccessTracker, KeyStat, TrackerParams};
pub use config::HybridConfig;
pub use hybrid_index::{HybridIndex, HybridStats, IndexOrigin, StagedIndex};
pub use learned_index::LearnedIndex;
pub use migration::{BatchOutcome, MigrationQueue};
pub use policy::{MigrationTrigger, PolicyParams, ThresholdController, WorkloadStats};
pub use staging_index::StagingIndex;
pub use sub_index::SubIndex;
