//! Staging sub-index - write-optimized ordered store (S)
//!
//! Recently inserted entries land here before the migration engine promotes
//! them to the stable side. The profile is the inverse of the stable index:
//! cheap incremental insert, tolerable point lookup, ordered traversal, and
//! removal by key (promotion evicts directly, no masking filter needed).

use std::collections::BTreeMap;
use std::ops::Bound;

use anyhow::Result;

use crate::sub_index::SubIndex;

/// BTreeMap-backed staging store.
#[derive(Debug, Default)]
pub struct StagingIndex {
    map: BTreeMap<u64, u64>,
}

impl StagingIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SubIndex for StagingIndex {
    fn build_bulk(&mut self, entries: &[(u64, u64)]) -> Result<()> {
        self.map = entries.iter().copied().collect();
        Ok(())
    }

    fn lookup(&self, key: u64) -> Option<u64> {
        self.map.get(&key).copied()
    }

    fn range_count(&self, lo: u64, hi: u64) -> usize {
        if lo > hi {
            return 0;
        }
        self.map
            .range((Bound::Included(lo), Bound::Included(hi)))
            .count()
    }

    fn range_entries(&self, lo: u64, hi: u64) -> Vec<(u64, u64)> {
        if lo > hi {
            return Vec::new();
        }
        self.map
            .range((Bound::Included(lo), Bound::Included(hi)))
            .map(|(k, v)| (*k, *v))
            .collect()
    }

    fn insert(&mut self, key: u64, value: u64) -> Result<()> {
        self.map.insert(key, value);
        Ok(())
    }

    fn remove(&mut self, key: u64) -> bool {
        self.map.remove(&key).is_some()
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}
