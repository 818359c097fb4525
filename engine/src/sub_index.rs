//! Sub-index adapter contract
//!
//! The hybrid façade is insensitive to the two concrete ordered stores it
//! composes. Both the staging side (write-optimized) and the stable side
//! (read-optimized, bulk-built) implement this trait; the façade is generic
//! over the pair, so the lookup hot path is monomorphized per configuration.

use anyhow::Result;

/// Uniform contract over the staging and stable sub-indexes.
///
/// Both stores keep entries in strict ascending key order and hold a key at
/// most once. `lookup` returning `None` is the NOT_FOUND sentinel, never an
/// error.
pub trait SubIndex: Send + Sync {
    /// Replace contents with a sorted, duplicate-free sequence of entries.
    fn build_bulk(&mut self, entries: &[(u64, u64)]) -> Result<()>;

    /// Point lookup. `None` means the key is not present.
    fn lookup(&self, key: u64) -> Option<u64>;

    /// Number of keys in the inclusive range `[lo, hi]`.
    fn range_count(&self, lo: u64, hi: u64) -> usize;

    /// Entries in the inclusive range `[lo, hi]`, ascending by key.
    fn range_entries(&self, lo: u64, hi: u64) -> Vec<(u64, u64)>;

    /// Insert one entry. Overwrites the value on a duplicate key.
    fn insert(&mut self, key: u64, value: u64) -> Result<()>;

    /// Remove a key. Returns whether it was present.
    fn remove(&mut self, key: u64) -> bool;

    /// Count of entries.
    fn len(&self) -> usize;

    /// True when no entries are stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
