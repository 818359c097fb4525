//! Stable sub-index - read-optimized segmented learned store (L)
//!
//! Sorted entries are partitioned into segments; each segment fits a local
//! linear model mapping key -> position, and point lookups binary-search a
//! window bounded by the model's observed worst-case error. Bulk build is a
//! single pass over sorted input. Per-element mutation is deliberately the
//! expensive operation: it re-sorts the owning segment's data and refits the
//! local model, which is the cost profile the hybrid routes around.

use anyhow::{bail, Result};

use crate::sub_index::SubIndex;

/// Local linear model predicting the position of a key inside one segment.
#[derive(Debug, Clone)]
struct LocalLinearModel {
    slope: f64,
    intercept: f64,
    error_bound: usize,
    data_len: usize,
}

impl LocalLinearModel {
    /// Fit position = slope * key + intercept over sorted data and record the
    /// exact worst-case prediction error, so the bounded search window is
    /// always sufficient.
    fn fit(data: &[(u64, u64)]) -> Self {
        if data.len() < 2 {
            return Self {
                slope: 0.0,
                intercept: 0.0,
                error_bound: 0,
                data_len: data.len(),
            };
        }

        let data_len = data.len();
        let key_min = data[0].0;
        let key_max = data[data_len - 1].0;

        let (slope, intercept) = if key_max == key_min {
            (0.0, 0.0)
        } else {
            let slope = (data_len - 1) as f64 / (key_max - key_min) as f64;
            (slope, -(key_min as f64) * slope)
        };

        let mut max_error = 0usize;
        for (i, &(key, _)) in data.iter().enumerate() {
            let predicted = (slope * key as f64 + intercept).max(0.0) as usize;
            let predicted = predicted.min(data_len - 1);
            max_error = max_error.max(predicted.abs_diff(i));
        }

        Self {
            slope,
            intercept,
            error_bound: max_error,
            data_len,
        }
    }

    #[inline(always)]
    fn predict(&self, key: u64) -> usize {
        if self.data_len == 0 {
            return 0;
        }
        let predicted = (self.slope * key as f64 + self.intercept).max(0.0) as usize;
        predicted.min(self.data_len - 1)
    }
}

/// One sorted run of entries with its fitted model.
#[derive(Debug)]
struct Segment {
    model: LocalLinearModel,
    data: Vec<(u64, u64)>,
}

impl Segment {
    fn new(data: Vec<(u64, u64)>) -> Self {
        let model = LocalLinearModel::fit(&data);
        Self { model, data }
    }

    #[inline]
    fn min_key(&self) -> u64 {
        self.data[0].0
    }

    #[inline]
    fn max_key(&self) -> u64 {
        self.data[self.data.len() - 1].0
    }

    /// Model-guided point lookup: binary search within the error window
    /// around the predicted position.
    fn bounded_search(&self, key: u64) -> Option<u64> {
        if self.data.is_empty() {
            return None;
        }

        let predicted = self.model.predict(key);
        let epsilon = self.model.error_bound;
        let start = predicted.saturating_sub(epsilon);
        let end = (predicted + epsilon + 1).min(self.data.len());

        match self.data[start..end].binary_search_by_key(&key, |(k, _)| *k) {
            Ok(idx) => Some(self.data[start + idx].1),
            Err(_) => None,
        }
    }

    /// Sorted insertion plus model refit. Overwrites on duplicate key.
    /// Returns true when the entry was new.
    fn insert(&mut self, key: u64, value: u64) -> bool {
        match self.data.binary_search_by_key(&key, |(k, _)| *k) {
            Ok(idx) => {
                self.data[idx].1 = value;
                false
            }
            Err(idx) => {
                self.data.insert(idx, (key, value));
                self.model = LocalLinearModel::fit(&self.data);
                true
            }
        }
    }

    fn remove(&mut self, key: u64) -> bool {
        match self.data.binary_search_by_key(&key, |(k, _)| *k) {
            Ok(idx) => {
                self.data.remove(idx);
                self.model = LocalLinearModel::fit(&self.data);
                true
            }
            Err(_) => false,
        }
    }

    /// Positions covering the inclusive key range `[lo, hi]`.
    fn range_bounds(&self, lo: u64, hi: u64) -> (usize, usize) {
        let start = self.data.partition_point(|(k, _)| *k < lo);
        let end = self.data.partition_point(|(k, _)| *k <= hi);
        (start, end)
    }
}

/// Segmented learned index over 64-bit keys.
pub struct LearnedIndex {
    segments: Vec<Segment>,
    target_segment_size: usize,
    total_len: usize,
}

impl LearnedIndex {
    pub const DEFAULT_SEGMENT_SIZE: usize = 1024;

    pub fn new(target_segment_size: usize) -> Self {
        Self {
            segments: Vec::new(),
            target_segment_size: target_segment_size.max(1),
            total_len: 0,
        }
    }

    /// Binary search for the segment whose key range contains `key`.
    fn locate(&self, key: u64) -> Option<usize> {
        self.segments
            .binary_search_by(|seg| {
                if key < seg.min_key() {
                    std::cmp::Ordering::Greater
                } else if key > seg.max_key() {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .ok()
    }

    /// Segment an out-of-range key should be inserted into: the one covering
    /// it, otherwise the nearest preceding segment (the first segment for
    /// keys below every range).
    fn locate_for_insert(&self, key: u64) -> usize {
        debug_assert!(!self.segments.is_empty());
        let idx = self
            .segments
            .partition_point(|seg| seg.min_key() <= key);
        idx.saturating_sub(1)
    }

    /// Split a segment that outgrew twice the target size into two halves.
    fn maybe_split(&mut self, idx: usize) {
        if self.segments[idx].data.len() <= self.target_segment_size * 2 {
            return;
        }
        let right_data = {
            let seg = &mut self.segments[idx];
            let mid = seg.data.len() / 2;
            let right = seg.data.split_off(mid);
            seg.model = LocalLinearModel::fit(&seg.data);
            right
        };
        self.segments.insert(idx + 1, Segment::new(right_data));
    }

    /// Number of segments (diagnostics).
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }
}

impl Default for LearnedIndex {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SEGMENT_SIZE)
    }
}

impl SubIndex for LearnedIndex {
    fn build_bulk(&mut self, entries: &[(u64, u64)]) -> Result<()> {
        if entries.windows(2).any(|w| w[0].0 >= w[1].0) {
            bail!("bulk build requires strictly ascending keys");
        }

        self.segments = entries
            .chunks(self.target_segment_size)
            .map(|chunk| Segment::new(chunk.to_vec()))
            .collect();
        self.total_len = entries.len();
        Ok(())
    }

    fn lookup(&self, key: u64) -> Option<u64> {
        let idx = self.locate(key)?;
        self.segments[idx].bounded_search(key)
    }

    fn range_count(&self, lo: u64, hi: u64) -> usize {
        if lo > hi {
            return 0;
        }
        let mut count = 0;
        for seg in &self.segments {
            if seg.max_key() < lo {
                continue;
            }
            if seg.min_key() > hi {
                break;
            }
            let (start, end) = seg.range_bounds(lo, hi);
            count += end - start;
        }
        count
    }

    fn range_entries(&self, lo: u64, hi: u64) -> Vec<(u64, u64)> {
        if lo > hi {
            return Vec::new();
        }
        let mut out = Vec::new();
        for seg in &self.segments {
            if seg.max_key() < lo {
                continue;
            }
            if seg.min_key() > hi {
                break;
            }
            let (start, end) = seg.range_bounds(lo, hi);
            out.extend_from_slice(&seg.data[start..end]);
        }
        out
    }

    fn insert(&mut self, key: u64, value: u64) -> Result<()> {
        if self.segments.is_empty() {
            self.segments.push(Segment::new(vec![(key, value)]));
            self.total_len = 1;
            return Ok(());
        }

        let idx = self.locate_for_insert(key);
        if self.segments[idx].insert(key, value) {
            self.total_len += 1;
            self.maybe_split(idx);
        }
        Ok(())
    }

    fn remove(&mut self, key: u64) -> bool {
        let Some(idx) = self.locate(key) else {
            return false;
        };
        if self.segments[idx].remove(key) {
            self.total_len -= 1;
            if self.segments[idx].data.is_empty() {
                self.segments.remove(idx);
            }
            true
        } else {
            false
        }
    }

    fn len(&self) -> usize {
        self.total_len
    }
}
