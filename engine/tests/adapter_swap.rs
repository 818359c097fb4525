//! Swapping the stable sub-index implementation must not change anything a
//! caller can observe: lookup results, sizes, and range counts stay
//! identical for the same operation sequence.

use anyhow::Result;
use stratakv_engine::{HybridConfig, HybridIndex, StagedIndex, StagingIndex, SubIndex};

/// Plain sorted-vector store standing in for the stable side.
#[derive(Default)]
struct SortedVecIndex {
    entries: Vec<(u64, u64)>,
}

impl SubIndex for SortedVecIndex {
    fn build_bulk(&mut self, entries: &[(u64, u64)]) -> Result<()> {
        self.entries = entries.to_vec();
        Ok(())
    }

    fn lookup(&self, key: u64) -> Option<u64> {
        self.entries
            .binary_search_by_key(&key, |(k, _)| *k)
            .ok()
            .map(|idx| self.entries[idx].1)
    }

    fn range_count(&self, lo: u64, hi: u64) -> usize {
        if lo > hi {
            return 0;
        }
        let start = self.entries.partition_point(|(k, _)| *k < lo);
        let end = self.entries.partition_point(|(k, _)| *k <= hi);
        end - start
    }

    fn range_entries(&self, lo: u64, hi: u64) -> Vec<(u64, u64)> {
        if lo > hi {
            return Vec::new();
        }
        let start = self.entries.partition_point(|(k, _)| *k < lo);
        let end = self.entries.partition_point(|(k, _)| *k <= hi);
        self.entries[start..end].to_vec()
    }

    fn insert(&mut self, key: u64, value: u64) -> Result<()> {
        match self.entries.binary_search_by_key(&key, |(k, _)| *k) {
            Ok(idx) => self.entries[idx].1 = value,
            Err(idx) => self.entries.insert(idx, (key, value)),
        }
        Ok(())
    }

    fn remove(&mut self, key: u64) -> bool {
        match self.entries.binary_search_by_key(&key, |(k, _)| *k) {
            Ok(idx) => {
                self.entries.remove(idx);
                true
            }
            Err(_) => false,
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// One observable event per step of the driver script.
#[derive(Debug, PartialEq, Eq)]
enum Observation {
    Looked(u64, Option<u64>),
    Size(usize),
    Ranged(u64, u64, usize),
}

fn config() -> HybridConfig {
    HybridConfig {
        migration_threshold: 0.25,
        check_period: 10,
        consecutive_window_ms: 1000,
        ..Default::default()
    }
}

fn drive<S, L>(idx: &HybridIndex<S, L>) -> Vec<Observation>
where
    S: SubIndex + 'static,
    L: SubIndex + 'static,
{
    let mut log = Vec::new();

    idx.build((0..50u64).map(|k| (k * 2, k)).collect(), 1).unwrap();
    log.push(Observation::Size(idx.size()));

    for k in 100..140u64 {
        idx.insert(k, k * 3).unwrap();
    }
    log.push(Observation::Size(idx.size()));

    // Heat a couple of staged keys, then force a batch.
    for _ in 0..3 {
        idx.lookup(110);
        idx.lookup(120);
    }
    idx.migrate_now();

    for k in [0u64, 2, 49, 98, 110, 120, 139, 500] {
        log.push(Observation::Looked(k, idx.lookup(k)));
    }
    for (lo, hi) in [(0u64, 300u64), (90, 125), (101, 101), (200, 100)] {
        log.push(Observation::Ranged(lo, hi, idx.range_count(lo, hi)));
    }

    for k in 100..140u64 {
        idx.insert(k, k).unwrap();
    }
    for k in [100u64, 110, 139] {
        log.push(Observation::Looked(k, idx.lookup(k)));
    }
    log.push(Observation::Size(idx.size()));

    log
}

#[test]
fn swapping_stable_implementation_is_unobservable() {
    let learned = StagedIndex::new(config()).unwrap();
    let mirrored = HybridIndex::with_indexes(
        config(),
        StagingIndex::new(),
        SortedVecIndex::default(),
    )
    .unwrap();

    assert_eq!(drive(&learned), drive(&mirrored));
}
