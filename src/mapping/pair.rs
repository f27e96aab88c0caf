//! Paired-end resolution — two-pointer sweeps that intersect the two mates'
//! sorted candidate lists under the insert-size window, and later their
//! verified alignment lists to enumerate concordant pairs.
//!
//! Only FR (mate 1 positive, mate 2 negative) and RF (mate 1 negative,
//! mate 2 positive) orientations are considered.

use crate::mapping::Direction;
use crate::mapping::verify::Alignment;

// ---------------------------------------------------------------------------
// Candidate reduction
// ---------------------------------------------------------------------------

/// Intersect one orientation arm's candidate lists under the insert-size
/// window.
///
/// Both lists are sorted by packed `rid|pos`; the window arithmetic happens
/// on the packed values, so candidates on different references never pair.
/// The `previous_end` watermark emits each mate-2 candidate at most once,
/// keeping the reduced lists sorted and duplicate-free.
pub fn reduce_candidates_on_one_direction(
    candidates1: &[u64],
    candidates2: &[u64],
    max_insert_size: u32,
    filtered1: &mut Vec<u64>,
    filtered2: &mut Vec<u64>,
) {
    let mut i1 = 0usize;
    let mut i2 = 0usize;
    let distance = max_insert_size as u64;
    let mut previous_end_i2 = i2;
    while i1 < candidates1.len() && i2 < candidates2.len() {
        if candidates1[i1] > candidates2[i2] + distance {
            i2 += 1;
        } else if candidates2[i2] > candidates1[i1] + distance {
            i1 += 1;
        } else {
            // In range: collect every mate-2 candidate within the window,
            // then advance mate 1 and resume from the watermark.
            filtered1.push(candidates1[i1]);
            let mut current_i2 = i2;
            while current_i2 < candidates2.len()
                && candidates2[current_i2] <= candidates1[i1] + distance
            {
                if current_i2 >= previous_end_i2 {
                    filtered2.push(candidates2[current_i2]);
                }
                current_i2 += 1;
            }
            previous_end_i2 = current_i2;
            i1 += 1;
        }
    }
}

/// Reduce all four candidate lists of a read pair.
///
/// FR pairs mate 1 positive candidates with mate 2 negative candidates; RF
/// mirrors it.
#[allow(clippy::too_many_arguments)]
pub fn reduce_candidates_for_paired_end_read(
    positive_candidates1: &[u64],
    negative_candidates1: &[u64],
    positive_candidates2: &[u64],
    negative_candidates2: &[u64],
    max_insert_size: u32,
    filtered_positive1: &mut Vec<u64>,
    filtered_negative1: &mut Vec<u64>,
    filtered_positive2: &mut Vec<u64>,
    filtered_negative2: &mut Vec<u64>,
) {
    reduce_candidates_on_one_direction(
        positive_candidates1,
        negative_candidates2,
        max_insert_size,
        filtered_positive1,
        filtered_negative2,
    );
    reduce_candidates_on_one_direction(
        negative_candidates1,
        positive_candidates2,
        max_insert_size,
        filtered_negative1,
        filtered_positive2,
    );
}

// ---------------------------------------------------------------------------
// Paired best-mapping enumeration
// ---------------------------------------------------------------------------

/// Running best / second-best bookkeeping over paired sum-of-errors.
#[derive(Debug, Clone, Copy)]
pub struct PairedBestCounts {
    pub min_sum_errors: i32,
    pub num_best_mappings: i32,
    pub second_min_sum_errors: i32,
    pub num_second_best_mappings: i32,
}

impl PairedBestCounts {
    /// Start both tiers at the paired rejection sentinel `2E + 1`.
    pub fn new(error_threshold: usize) -> Self {
        let sentinel = 2 * error_threshold as i32 + 1;
        Self {
            min_sum_errors: sentinel,
            num_best_mappings: 0,
            second_min_sum_errors: sentinel,
            num_second_best_mappings: 0,
        }
    }
}

/// Enumerate concordant pairs for one orientation arm.
///
/// `mappings1` holds the alignments of mate 1 in `first_read_direction`,
/// `mappings2` the opposite-strand alignments of mate 2; both are sorted by
/// packed end position. The window bounds depend on the orientation, with
/// `min_overlap` (the minimum read length) bounding how far the mates may
/// overlap. Index pairs achieving the current minimum sum of errors are
/// appended to `best_mappings`; stale entries from earlier, larger minima
/// remain and are filtered again at emission time.
#[allow(clippy::too_many_arguments)]
pub fn generate_best_mappings_on_one_direction(
    first_read_direction: Direction,
    mappings1: &[Alignment],
    mappings2: &[Alignment],
    read1_length: u32,
    read2_length: u32,
    max_insert_size: u32,
    min_overlap: u32,
    best_mappings: &mut Vec<(u32, u32)>,
    counts: &mut PairedBestCounts,
) {
    let mut i1 = 0usize;
    let mut i2 = 0usize;
    let insert = max_insert_size as u64;
    let r1 = read1_length as u64;
    let r2 = read2_length as u64;
    let overlap = min_overlap as u64;

    // Window comparisons are kept in addition form so small packed
    // positions cannot underflow.
    while i1 < mappings1.len() && i2 < mappings2.len() {
        let m1 = mappings1[i1].1;
        let m2 = mappings2[i2].1;
        let mate2_behind = match first_read_direction {
            Direction::Positive => m1 + overlap > m2 + r2,
            Direction::Negative => m1 + r1 > m2 + insert,
        };
        if mate2_behind {
            i2 += 1;
            continue;
        }
        let mate1_behind = match first_read_direction {
            Direction::Positive => m2 + r2 > m1 + insert,
            Direction::Negative => m2 + overlap > m1 + r1,
        };
        if mate1_behind {
            i1 += 1;
            continue;
        }
        // In range: sweep every mate-2 alignment within the window for this
        // mate-1 alignment, then advance mate 1.
        let mut current_i2 = i2;
        while current_i2 < mappings2.len() {
            let m2c = mappings2[current_i2].1;
            let in_window = match first_read_direction {
                Direction::Positive => m2c + r2 <= m1 + insert,
                Direction::Negative => m2c + overlap <= m1 + r1,
            };
            if !in_window {
                break;
            }
            let current_sum_errors = mappings1[i1].0 + mappings2[current_i2].0;
            if current_sum_errors < counts.min_sum_errors {
                counts.second_min_sum_errors = counts.min_sum_errors;
                counts.num_second_best_mappings = counts.num_best_mappings;
                counts.min_sum_errors = current_sum_errors;
                counts.num_best_mappings = 1;
                best_mappings.push((i1 as u32, current_i2 as u32));
            } else if current_sum_errors == counts.min_sum_errors {
                counts.num_best_mappings += 1;
                best_mappings.push((i1 as u32, current_i2 as u32));
            } else if current_sum_errors == counts.second_min_sum_errors {
                counts.num_second_best_mappings += 1;
            }
            current_i2 += 1;
        }
        i1 += 1;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::record::pack_rid_pos;

    #[test]
    fn test_reduce_keeps_nearby_candidates() {
        let c1 = vec![pack_rid_pos(0, 100)];
        let c2 = vec![pack_rid_pos(0, 300), pack_rid_pos(0, 900)];
        let mut f1 = Vec::new();
        let mut f2 = Vec::new();
        reduce_candidates_on_one_direction(&c1, &c2, 400, &mut f1, &mut f2);
        assert_eq!(f1, vec![pack_rid_pos(0, 100)]);
        assert_eq!(f2, vec![pack_rid_pos(0, 300)]);
    }

    #[test]
    fn test_reduce_across_references_is_empty() {
        let c1 = vec![pack_rid_pos(0, 100)];
        let c2 = vec![pack_rid_pos(1, 100)];
        let mut f1 = Vec::new();
        let mut f2 = Vec::new();
        reduce_candidates_on_one_direction(&c1, &c2, 400, &mut f1, &mut f2);
        assert!(f1.is_empty());
        assert!(f2.is_empty());
    }

    #[test]
    fn test_reduce_emits_each_mate2_candidate_once() {
        let c1 = vec![pack_rid_pos(0, 100), pack_rid_pos(0, 150)];
        let c2 = vec![pack_rid_pos(0, 200), pack_rid_pos(0, 400)];
        let mut f1 = Vec::new();
        let mut f2 = Vec::new();
        reduce_candidates_on_one_direction(&c1, &c2, 400, &mut f1, &mut f2);
        // Both mate-1 candidates survive; each mate-2 candidate appears once
        // even though both windows cover position 200.
        assert_eq!(f1.len(), 2);
        assert_eq!(f2, vec![pack_rid_pos(0, 200), pack_rid_pos(0, 400)]);
    }

    #[test]
    fn test_paired_enumeration_fr() {
        // Mate 1 positive ends at 29, mate 2 negative ends at 199.
        let m1: Vec<Alignment> = vec![(0, pack_rid_pos(0, 29))];
        let m2: Vec<Alignment> = vec![(0, pack_rid_pos(0, 199))];
        let mut best = Vec::new();
        let mut counts = PairedBestCounts::new(3);
        generate_best_mappings_on_one_direction(
            Direction::Positive,
            &m1,
            &m2,
            20,
            20,
            400,
            30,
            &mut best,
            &mut counts,
        );
        assert_eq!(counts.min_sum_errors, 0);
        assert_eq!(counts.num_best_mappings, 1);
        assert_eq!(best, vec![(0, 0)]);
    }

    #[test]
    fn test_paired_enumeration_rejects_distant_mate() {
        let m1: Vec<Alignment> = vec![(0, pack_rid_pos(0, 29))];
        let m2: Vec<Alignment> = vec![(0, pack_rid_pos(0, 2000))];
        let mut best = Vec::new();
        let mut counts = PairedBestCounts::new(3);
        generate_best_mappings_on_one_direction(
            Direction::Positive,
            &m1,
            &m2,
            20,
            20,
            400,
            30,
            &mut best,
            &mut counts,
        );
        assert_eq!(counts.num_best_mappings, 0);
        assert!(best.is_empty());
    }

    #[test]
    fn test_paired_enumeration_demotes_previous_best() {
        // First pair found sums to 1, a later pair sums to 0: the earlier
        // best is demoted to second best, and its stale index pair stays in
        // the list for the emission-time filter to drop.
        let m1: Vec<Alignment> = vec![(1, pack_rid_pos(0, 29)), (0, pack_rid_pos(0, 529))];
        let m2: Vec<Alignment> = vec![(0, pack_rid_pos(0, 199)), (0, pack_rid_pos(0, 699))];
        let mut best = Vec::new();
        let mut counts = PairedBestCounts::new(3);
        generate_best_mappings_on_one_direction(
            Direction::Positive,
            &m1,
            &m2,
            20,
            20,
            400,
            30,
            &mut best,
            &mut counts,
        );
        assert_eq!(counts.min_sum_errors, 0);
        assert_eq!(counts.num_best_mappings, 1);
        assert_eq!(counts.second_min_sum_errors, 1);
        assert_eq!(counts.num_second_best_mappings, 1);
        assert_eq!(best, vec![(0, 0), (1, 1)]);
    }
}
