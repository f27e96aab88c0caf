//! Multi-mapping allocation — distributes reads with MAPQ < 30 across their
//! candidate loci, weighted by how many uniquely mapped fragments overlap
//! each locus.
//!
//! Uniquely mapped fragments (MAPQ ≥ 30) are indexed per reference in an
//! augmented interval tree: intervals sorted by start in an array treated as
//! an implicit balanced binary tree, each node augmented with the maximum
//! end position in its subtree. The tree is built once (`add` then `index`)
//! and queried read-only afterwards; the two phases are never interleaved.

use rand::SeedableRng;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;

use crate::mapping::record::{Mapping, PerRefMappings};

// ---------------------------------------------------------------------------
// IntervalTree
// ---------------------------------------------------------------------------

/// Augmented interval tree over `[start, end)` ranges.
#[derive(Debug, Default)]
pub struct IntervalTree {
    starts: Vec<u32>,
    ends: Vec<u32>,
    max_ends: Vec<u32>,
    max_level: usize,
    indexed: bool,
}

/// One frame of the iterative tree walk: node index, level, and whether the
/// left child has been visited.
struct StackCell {
    x: usize,
    k: usize,
    w: bool,
}

impl IntervalTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored intervals.
    pub fn len(&self) -> usize {
        self.starts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }

    /// Add an interval. Only valid before `index()`.
    pub fn add(&mut self, start: u32, end: u32) {
        debug_assert!(!self.indexed);
        self.starts.push(start);
        self.ends.push(end);
    }

    /// Sort the intervals and compute the max-end augmentation. Must be
    /// called once, after all `add()`s and before any `overlap_count()`.
    pub fn index(&mut self) {
        let n = self.starts.len();
        let mut intervals: Vec<(u32, u32)> = self
            .starts
            .iter()
            .copied()
            .zip(self.ends.iter().copied())
            .collect();
        intervals.sort_unstable();
        for (i, &(s, e)) in intervals.iter().enumerate() {
            self.starts[i] = s;
            self.ends[i] = e;
        }
        self.max_ends = vec![0; n];
        self.indexed = true;
        if n == 0 {
            self.max_level = 0;
            return;
        }

        // Leaves: every even index is a level-0 node.
        let mut last = 0u32;
        let mut last_i = 0usize;
        let mut i = 0;
        while i < n {
            self.max_ends[i] = self.ends[i];
            last = self.ends[i];
            last_i = i;
            i += 2;
        }

        let mut k = 1usize;
        while (1usize << k) <= n {
            let x = 1usize << (k - 1);
            let i0 = (x << 1) - 1;
            let step = x << 2;
            let mut i = i0;
            while i < n {
                let end_left = self.max_ends[i - x];
                let end_right = if i + x < n { self.max_ends[i + x] } else { last };
                let mut e = self.ends[i];
                if e < end_left {
                    e = end_left;
                }
                if e < end_right {
                    e = end_right;
                }
                self.max_ends[i] = e;
                i += step;
            }
            last_i = if (last_i >> k) & 1 != 0 {
                last_i - x
            } else {
                last_i + x
            };
            if last_i < n && self.max_ends[last_i] > last {
                last = self.max_ends[last_i];
            }
            k += 1;
        }
        self.max_level = k - 1;
    }

    /// Count stored intervals overlapping `[start, end)`.
    pub fn overlap_count(&self, start: u32, end: u32) -> u32 {
        debug_assert!(self.indexed);
        let n = self.starts.len();
        if n == 0 {
            return 0;
        }
        let mut count = 0u32;
        let mut stack: Vec<StackCell> = Vec::with_capacity(64);
        stack.push(StackCell {
            k: self.max_level,
            x: (1usize << self.max_level) - 1,
            w: false,
        });
        while let Some(cell) = stack.pop() {
            if cell.k <= 3 {
                // Small subtree: scan it linearly.
                let i0 = (cell.x >> cell.k) << cell.k;
                let i1 = (i0 + (1usize << (cell.k + 1)) - 1).min(n);
                let mut i = i0;
                while i < i1 && self.starts[i] < end {
                    if start < self.ends[i] {
                        count += 1;
                    }
                    i += 1;
                }
            } else if !cell.w {
                // Left child first, if anything there can still overlap.
                let y = cell.x - (1usize << (cell.k - 1));
                stack.push(StackCell {
                    k: cell.k,
                    x: cell.x,
                    w: true,
                });
                if y >= n || self.max_ends[y] > start {
                    stack.push(StackCell {
                        k: cell.k - 1,
                        x: y,
                        w: false,
                    });
                }
            } else if cell.x < n && self.starts[cell.x] < end {
                if start < self.ends[cell.x] {
                    count += 1;
                }
                stack.push(StackCell {
                    k: cell.k - 1,
                    x: cell.x + (1usize << (cell.k - 1)),
                    w: false,
                });
            }
        }
        count
    }
}

// ---------------------------------------------------------------------------
// allocate_multi_mappings
// ---------------------------------------------------------------------------

/// Window around a multi-mapping locus inside which unique fragments count
/// as support.
const OVERLAP_WINDOW_SIZE: u32 = 100;

/// Distribute every multi-mapped read (MAPQ < 30) to exactly one of its
/// loci.
///
/// Builds one interval tree per reference from the uniquely mapped
/// fragments, gathers all multi-mapping records as `(read_id, rid, index)`
/// tuples sorted by read id, and for each read samples one locus from the
/// discrete distribution weighted by unique-fragment overlap counts within
/// ±100 bp. All-zero weights fall back to uniform. Deterministic given the
/// seed and the (canonically sorted) input order.
pub fn allocate_multi_mappings<R: Mapping>(
    mappings: &PerRefMappings<R>,
    seed: u64,
    allocated: &mut PerRefMappings<R>,
) -> u64 {
    let num_refs = mappings.len();
    let mut unique_mapping_trees: Vec<IntervalTree> =
        (0..num_refs).map(|_| IntervalTree::new()).collect();
    let mut multi_mapping_indices: Vec<(u32, u32, u32)> = Vec::new();

    for (ri, per_ref) in mappings.iter().enumerate() {
        for (mi, record) in per_ref.iter().enumerate() {
            if record.mapq() < 30 {
                multi_mapping_indices.push((record.read_id(), ri as u32, mi as u32));
            } else {
                unique_mapping_trees[ri]
                    .add(record.start(), record.start() + record.len() as u32);
            }
        }
        unique_mapping_trees[ri].index();
    }

    if multi_mapping_indices.is_empty() {
        return 0;
    }
    multi_mapping_indices.sort_unstable();
    // Sentinel row: its read id differs from every real read, so the final
    // run is flushed by the regular boundary logic.
    let last = *multi_mapping_indices.last().unwrap();
    multi_mapping_indices.push((u32::MAX, last.1, last.2));

    let mut generator = StdRng::seed_from_u64(seed);
    let mut weights: Vec<u32> = Vec::new();
    let mut previous_read_id = multi_mapping_indices[0].0;
    let mut start_mapping_index = 0usize;
    let mut num_allocated = 0u64;

    for mi in 0..multi_mapping_indices.len() {
        let (current_read_id, reference_id, mapping_index) = multi_mapping_indices[mi];
        let record = &mappings[reference_id as usize][mapping_index as usize];
        let interval_start = record.start().saturating_sub(OVERLAP_WINDOW_SIZE);
        let interval_end = record.start() + record.len() as u32 + OVERLAP_WINDOW_SIZE;
        let num_overlaps =
            unique_mapping_trees[reference_id as usize].overlap_count(interval_start, interval_end);

        if current_read_id != previous_read_id {
            // Close out the previous read's run.
            if weights.iter().all(|&w| w == 0) {
                weights.iter_mut().for_each(|w| *w = 1);
            }
            let distribution = WeightedIndex::new(&weights)
                .expect("multi-mapping weights are non-empty and non-zero");
            let chosen = distribution.sample(&mut generator);
            let (_, arid, ami) = multi_mapping_indices[start_mapping_index + chosen];
            allocated[arid as usize].push(mappings[arid as usize][ami as usize]);
            num_allocated += 1;

            weights.clear();
            start_mapping_index = mi;
            previous_read_id = current_read_id;
        }
        weights.push(num_overlaps);
    }
    num_allocated
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::record::{SeMapping, new_per_ref_mappings};

    #[test]
    fn test_tree_empty() {
        let mut tree = IntervalTree::new();
        tree.index();
        assert_eq!(tree.overlap_count(0, 100), 0);
    }

    #[test]
    fn test_tree_basic_overlaps() {
        let mut tree = IntervalTree::new();
        tree.add(10, 50);
        tree.add(40, 80);
        tree.add(100, 120);
        tree.index();
        assert_eq!(tree.overlap_count(0, 10), 0);
        assert_eq!(tree.overlap_count(0, 11), 1);
        assert_eq!(tree.overlap_count(45, 46), 2);
        assert_eq!(tree.overlap_count(80, 100), 0);
        assert_eq!(tree.overlap_count(0, 200), 3);
        assert_eq!(tree.overlap_count(119, 300), 1);
    }

    #[test]
    fn test_tree_matches_linear_scan() {
        // Deterministic pseudo-random intervals, checked against brute force.
        let mut state = 0x1234_5678_9ABC_DEF0u64;
        let mut next = |modulus: u32| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((state >> 33) as u32) % modulus
        };
        let mut tree = IntervalTree::new();
        let mut intervals = Vec::new();
        for _ in 0..500 {
            let start = next(10_000);
            let len = 1 + next(300);
            tree.add(start, start + len);
            intervals.push((start, start + len));
        }
        tree.index();
        for _ in 0..200 {
            let qs = next(10_500);
            let qe = qs + 1 + next(400);
            let expected = intervals
                .iter()
                .filter(|&&(s, e)| s < qe && qs < e)
                .count() as u32;
            assert_eq!(tree.overlap_count(qs, qe), expected, "query [{qs}, {qe})");
        }
    }

    fn se(read_id: u32, start: u32, length: u16, mapq: u8) -> SeMapping {
        SeMapping {
            read_id,
            barcode: 0,
            start,
            length,
            mapq,
        }
    }

    #[test]
    fn test_allocates_to_supported_locus() {
        // One multi-mapped read with two loci: locus A at 1000 overlaps
        // three unique fragments, locus B at 5000 overlaps none.
        let mut mappings = new_per_ref_mappings(1);
        mappings[0].push(se(10, 990, 50, 60));
        mappings[0].push(se(11, 1010, 50, 60));
        mappings[0].push(se(12, 1050, 50, 60));
        mappings[0].push(se(99, 1000, 36, 5));
        mappings[0].push(se(99, 5000, 36, 5));

        let mut allocated = new_per_ref_mappings(1);
        let n = allocate_multi_mappings(&mappings, 11, &mut allocated);
        assert_eq!(n, 1);
        assert_eq!(allocated[0].len(), 1);
        // Weight 3 vs 0: locus A wins regardless of the sampled value.
        assert_eq!(allocated[0][0].start, 1000);
    }

    #[test]
    fn test_zero_weight_fallback_is_uniform() {
        let mut mappings = new_per_ref_mappings(1);
        mappings[0].push(se(7, 1000, 36, 5));
        mappings[0].push(se(7, 5000, 36, 5));
        let mut allocated = new_per_ref_mappings(1);
        let n = allocate_multi_mappings(&mappings, 11, &mut allocated);
        assert_eq!(n, 1);
        assert_eq!(allocated[0].len(), 1);
        let start = allocated[0][0].start;
        assert!(start == 1000 || start == 5000);
    }

    #[test]
    fn test_one_record_per_multi_read() {
        let mut mappings = new_per_ref_mappings(2);
        // Read 1: two loci on two references. Read 2: three loci on one.
        mappings[0].push(se(1, 100, 36, 5));
        mappings[1].push(se(1, 200, 36, 5));
        mappings[0].push(se(2, 300, 36, 0));
        mappings[0].push(se(2, 400, 36, 0));
        mappings[0].push(se(2, 500, 36, 0));

        let mut allocated = new_per_ref_mappings(2);
        let n = allocate_multi_mappings(&mappings, 11, &mut allocated);
        assert_eq!(n, 2);
        assert_eq!(allocated[0].len() + allocated[1].len(), 2);
    }

    #[test]
    fn test_allocation_is_deterministic() {
        let mut mappings = new_per_ref_mappings(1);
        for read_id in 0..20 {
            mappings[0].push(se(read_id, 1000 + read_id * 10, 36, 5));
            mappings[0].push(se(read_id, 5000 + read_id * 10, 36, 5));
        }
        let mut a = new_per_ref_mappings(1);
        let mut b = new_per_ref_mappings(1);
        allocate_multi_mappings(&mappings, 11, &mut a);
        allocate_multi_mappings(&mappings, 11, &mut b);
        assert_eq!(a[0], b[0]);
    }
}
