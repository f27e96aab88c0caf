//! Best-mapping selection and record emission.
//!
//! When a read ties more best mappings than the reporting cap, a reservoir
//! sample of index positions decides which ones are emitted. Each accepted
//! mapping is then traced back through the banded aligner to recover its
//! start position, and a mapping record is pushed into the current thread's
//! per-reference buffer.

use rand::Rng;
use rand::rngs::StdRng;

use crate::index::reference::Reference;
use crate::mapping::align::banded_traceback;
use crate::mapping::mapq::mapq_from_counts;
use crate::mapping::pair::PairedBestCounts;
use crate::mapping::record::{PeMapping, PerRefMappings, SeMapping, packed_pos, packed_rid};
use crate::mapping::verify::{Alignment, BestMappingCounts};
use crate::mapping::{Direction, MapConfig};

// ---------------------------------------------------------------------------
// Reservoir sampling
// ---------------------------------------------------------------------------

/// Choose which of `num_best_mappings` tied best mappings get reported.
///
/// Fills `indices` with `0..max_num_best_mappings`; when the tie count
/// exceeds the cap, runs reservoir sampling over the remaining index
/// positions and sorts the survivors ascending so the emission scan can
/// consume them in order. Deterministic for a fixed RNG state.
pub fn fill_best_mapping_indices(
    indices: &mut Vec<usize>,
    num_best_mappings: usize,
    max_num_best_mappings: usize,
    rng: &mut StdRng,
) {
    indices.clear();
    indices.extend(0..max_num_best_mappings);
    if num_best_mappings > max_num_best_mappings {
        for i in max_num_best_mappings..num_best_mappings {
            let j = rng.gen_range(0..=i);
            if j < max_num_best_mappings {
                indices[j] = i;
            }
        }
        indices.sort_unstable();
    }
}

// ---------------------------------------------------------------------------
// Verification windows
// ---------------------------------------------------------------------------

/// Start of the traceback window for an alignment ending at `position`.
///
/// Clamped so the full `read_length + 2E` window stays inside the reference.
fn verification_window_start(position: u64, read_length: usize, e: usize, ref_len: u64) -> u64 {
    let span = (read_length + e) as u64;
    let mut window_start = if position + 1 > span {
        position + 1 - span
    } else {
        0
    };
    if position + e as u64 >= ref_len {
        window_start = ref_len - span;
    }
    window_start.min(ref_len.saturating_sub((read_length + 2 * e) as u64))
}

/// A read and its cached reverse complement, after any adapter trimming.
#[derive(Debug, Clone, Copy)]
pub struct ReadSpan<'a> {
    pub read: &'a [u8],
    pub negative: &'a [u8],
}

impl<'a> ReadSpan<'a> {
    #[inline]
    pub fn len(&self) -> usize {
        self.read.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Single-end emission
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
fn process_best_mappings_for_single_end_read(
    direction: Direction,
    mapq: u8,
    min_num_errors: i32,
    num_best_mappings: i32,
    read_id: u32,
    barcode: u32,
    read: &ReadSpan,
    reference: &Reference,
    best_mapping_indices: &[usize],
    mappings: &[Alignment],
    best_mapping_index: &mut usize,
    num_best_mappings_reported: &mut usize,
    config: &MapConfig,
    out: &mut PerRefMappings<SeMapping>,
) {
    let e = config.error_threshold;
    let read_length = read.len();
    let num_to_report = config.max_num_best_mappings.min(num_best_mappings as usize);

    for &(num_errors, packed) in mappings {
        if num_errors != min_num_errors {
            continue;
        }
        if *best_mapping_index == best_mapping_indices[*num_best_mappings_reported] {
            let rid = packed_rid(packed);
            let position = packed_pos(packed) as u64;
            let ref_len = reference.len(rid) as u64;
            let window_start = verification_window_start(position, read_length, e, ref_len);
            let pattern =
                &reference.seq(rid)[window_start as usize..window_start as usize + read_length + 2 * e];
            let text = match direction {
                Direction::Positive => read.read,
                Direction::Negative => read.negative,
            };
            let start_position =
                window_start + banded_traceback(min_num_errors, pattern, text, e) as u64;
            out[rid as usize].push(SeMapping {
                read_id,
                barcode,
                start: start_position as u32,
                length: (position + 1 - start_position) as u16,
                mapq,
            });
            *num_best_mappings_reported += 1;
            if *num_best_mappings_reported == num_to_report {
                break;
            }
        }
        *best_mapping_index += 1;
    }
}

/// Score, sample, and emit the best mappings of a single-end read.
#[allow(clippy::too_many_arguments)]
pub fn generate_best_mappings_for_single_end_read(
    counts: &BestMappingCounts,
    read_id: u32,
    barcode: u32,
    read: &ReadSpan,
    reference: &Reference,
    positive_mappings: &[Alignment],
    negative_mappings: &[Alignment],
    config: &MapConfig,
    rng: &mut StdRng,
    best_mapping_indices: &mut Vec<usize>,
    out: &mut PerRefMappings<SeMapping>,
) {
    let num_best = counts.num_best_mappings;
    if num_best <= 0 || num_best as usize > config.drop_repetitive_reads {
        return;
    }
    let mapq = mapq_from_counts(num_best, counts.num_second_best_mappings);
    fill_best_mapping_indices(
        best_mapping_indices,
        num_best as usize,
        config.max_num_best_mappings,
        rng,
    );

    let mut best_mapping_index = 0usize;
    let mut num_reported = 0usize;
    process_best_mappings_for_single_end_read(
        Direction::Positive,
        mapq,
        counts.min_num_errors,
        num_best,
        read_id,
        barcode,
        read,
        reference,
        best_mapping_indices,
        positive_mappings,
        &mut best_mapping_index,
        &mut num_reported,
        config,
        out,
    );
    if num_reported != config.max_num_best_mappings.min(num_best as usize) {
        process_best_mappings_for_single_end_read(
            Direction::Negative,
            mapq,
            counts.min_num_errors,
            num_best,
            read_id,
            barcode,
            read,
            reference,
            best_mapping_indices,
            negative_mappings,
            &mut best_mapping_index,
            &mut num_reported,
            config,
            out,
        );
    }
}

// ---------------------------------------------------------------------------
// Paired-end emission
// ---------------------------------------------------------------------------

/// One orientation arm of a read pair: the two alignment lists in play and
/// the best index pairs enumerated over them.
#[derive(Debug, Clone, Copy)]
pub struct PairedArm<'a> {
    pub mappings1: &'a [Alignment],
    pub mappings2: &'a [Alignment],
    pub best_mappings: &'a [(u32, u32)],
}

#[allow(clippy::too_many_arguments)]
fn process_best_mappings_for_paired_end_read(
    first_read_direction: Direction,
    mapq: u8,
    pair_counts: &PairedBestCounts,
    read_id: u32,
    barcode: u32,
    read1: &ReadSpan,
    read2: &ReadSpan,
    reference: &Reference,
    best_mapping_indices: &[usize],
    arm: &PairedArm,
    best_mapping_index: &mut usize,
    num_best_mappings_reported: &mut usize,
    config: &MapConfig,
    out: &mut PerRefMappings<PeMapping>,
) {
    let e = config.error_threshold;
    let num_to_report = config
        .max_num_best_mappings
        .min(pair_counts.num_best_mappings as usize);

    for &(i1, i2) in arm.best_mappings {
        let (errors1, packed1) = arm.mappings1[i1 as usize];
        let (errors2, packed2) = arm.mappings2[i2 as usize];
        if errors1 + errors2 != pair_counts.min_sum_errors {
            continue; // stale entry from an earlier, larger minimum
        }
        if *best_mapping_index == best_mapping_indices[*num_best_mappings_reported] {
            let rid1 = packed_rid(packed1);
            let position1 = packed_pos(packed1) as u64;
            let rid2 = packed_rid(packed2);
            let position2 = packed_pos(packed2) as u64;
            let window_start1 =
                verification_window_start(position1, read1.len(), e, reference.len(rid1) as u64);
            let window_start2 =
                verification_window_start(position2, read2.len(), e, reference.len(rid2) as u64);
            let pattern1 = &reference.seq(rid1)
                [window_start1 as usize..window_start1 as usize + read1.len() + 2 * e];
            let pattern2 = &reference.seq(rid2)
                [window_start2 as usize..window_start2 as usize + read2.len() + 2 * e];

            let record = match first_read_direction {
                Direction::Positive => {
                    let start1 =
                        window_start1 + banded_traceback(errors1, pattern1, read1.read, e) as u64;
                    let start2 =
                        window_start2 + banded_traceback(errors2, pattern2, read2.negative, e) as u64;
                    let fragment_start = start1;
                    let positive_alignment_length = (position1 + 1 - fragment_start) as u16;
                    PeMapping {
                        read_id,
                        barcode,
                        fragment_start: fragment_start as u32,
                        fragment_length: (position2 + 1 - fragment_start) as u16,
                        mapq,
                        positive_alignment_length: (positive_alignment_length << 1) | 1,
                        negative_alignment_length: (position2 + 1 - start2) as u16,
                    }
                }
                Direction::Negative => {
                    let start1 =
                        window_start1 + banded_traceback(errors1, pattern1, read1.negative, e) as u64;
                    let start2 =
                        window_start2 + banded_traceback(errors2, pattern2, read2.read, e) as u64;
                    let fragment_start = start2;
                    let positive_alignment_length = (position2 + 1 - fragment_start) as u16;
                    PeMapping {
                        read_id,
                        barcode,
                        fragment_start: fragment_start as u32,
                        fragment_length: (position1 + 1 - fragment_start) as u16,
                        mapq,
                        positive_alignment_length: positive_alignment_length << 1,
                        negative_alignment_length: (position1 + 1 - start1) as u16,
                    }
                }
            };
            out[rid1 as usize].push(record);
            *num_best_mappings_reported += 1;
            if *num_best_mappings_reported == num_to_report {
                break;
            }
        }
        *best_mapping_index += 1;
    }
}

/// Score, sample, and emit the best mappings of a read pair.
///
/// The FR arm is scanned first; the RF arm only runs if the reporting quota
/// is still open. Pairs with more best mappings than `drop_repetitive_reads`
/// are dropped entirely.
#[allow(clippy::too_many_arguments)]
pub fn generate_best_mappings_for_paired_end_read(
    pair_counts: &PairedBestCounts,
    read_id: u32,
    barcode: u32,
    read1: &ReadSpan,
    read2: &ReadSpan,
    reference: &Reference,
    f1r2: &PairedArm,
    f2r1: &PairedArm,
    config: &MapConfig,
    rng: &mut StdRng,
    best_mapping_indices: &mut Vec<usize>,
    out: &mut PerRefMappings<PeMapping>,
) {
    let num_best = pair_counts.num_best_mappings;
    if num_best <= 0 || num_best as usize > config.drop_repetitive_reads {
        return;
    }
    let mapq = mapq_from_counts(num_best, pair_counts.num_second_best_mappings);
    fill_best_mapping_indices(
        best_mapping_indices,
        num_best as usize,
        config.max_num_best_mappings,
        rng,
    );

    let mut best_mapping_index = 0usize;
    let mut num_reported = 0usize;
    process_best_mappings_for_paired_end_read(
        Direction::Positive,
        mapq,
        pair_counts,
        read_id,
        barcode,
        read1,
        read2,
        reference,
        best_mapping_indices,
        f1r2,
        &mut best_mapping_index,
        &mut num_reported,
        config,
        out,
    );
    if num_reported != config.max_num_best_mappings.min(num_best as usize) {
        process_best_mappings_for_paired_end_read(
            Direction::Negative,
            mapq,
            pair_counts,
            read_id,
            barcode,
            read1,
            read2,
            reference,
            best_mapping_indices,
            f2r1,
            &mut best_mapping_index,
            &mut num_reported,
            config,
            out,
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    use crate::io::batch::reverse_complement;
    use crate::mapping::pair::generate_best_mappings_on_one_direction;
    use crate::mapping::record::{Mapping, new_per_ref_mappings, pack_rid_pos};
    use crate::mapping::verify::verify_candidates;

    #[test]
    fn test_reservoir_is_deterministic_and_capped() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut indices = Vec::new();
        fill_best_mapping_indices(&mut indices, 20, 10, &mut rng);
        assert_eq!(indices.len(), 10);
        assert!(indices.windows(2).all(|w| w[0] < w[1]));
        assert!(indices.iter().all(|&i| i < 20));

        let mut rng2 = StdRng::seed_from_u64(11);
        let mut indices2 = Vec::new();
        fill_best_mapping_indices(&mut indices2, 20, 10, &mut rng2);
        assert_eq!(indices, indices2);
    }

    #[test]
    fn test_reservoir_identity_below_cap() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut indices = Vec::new();
        fill_best_mapping_indices(&mut indices, 3, 10, &mut rng);
        assert_eq!(indices, (0..10).collect::<Vec<_>>());
    }

    fn synthetic_sequence(len: usize) -> Vec<u8> {
        let mut state = 0x9E3779B97F4A7C15u64;
        (0..len)
            .map(|_| {
                state = state
                    .wrapping_mul(2862933555777941757)
                    .wrapping_add(3037000493);
                b"ACGT"[(state >> 60) as usize & 3]
            })
            .collect()
    }

    #[test]
    fn test_single_end_emission() {
        let reference = Reference::from_parts(
            vec!["chr1".to_string()],
            vec![b"TTGACCAGTCAAGGCTATCGGTCAATCCGGATTGACCTGA".to_vec()],
        );
        let config = MapConfig {
            error_threshold: 2,
            ..MapConfig::default()
        };
        let read = &reference.seq(0)[10..25];
        let mut negative = Vec::new();
        reverse_complement(read, &mut negative);
        let span = ReadSpan {
            read,
            negative: &negative,
        };

        let mut pos = Vec::new();
        let mut neg = Vec::new();
        let counts = verify_candidates(
            read,
            &negative,
            &[pack_rid_pos(0, 10)],
            &[],
            &reference,
            2,
            &mut pos,
            &mut neg,
        );

        let mut rng = StdRng::seed_from_u64(11);
        let mut indices = Vec::new();
        let mut out = new_per_ref_mappings(1);
        generate_best_mappings_for_single_end_read(
            &counts, 7, 0, &span, &reference, &pos, &neg, &config, &mut rng, &mut indices,
            &mut out,
        );

        assert_eq!(out[0].len(), 1);
        let rec = out[0][0];
        assert_eq!(rec.read_id, 7);
        assert_eq!(rec.start, 10);
        assert_eq!(rec.length, 15);
        assert_eq!(rec.mapq, 60);
        assert!(rec.start + rec.length as u32 <= reference.len(0) as u32);
    }

    #[test]
    fn test_paired_end_emission_fr() {
        let seq = synthetic_sequence(210);
        let reference = Reference::from_parts(vec!["chr1".to_string()], vec![seq]);
        let config = MapConfig {
            error_threshold: 2,
            ..MapConfig::default()
        };

        // Mate 1 = reference[10..30]; mate 2 = revcomp(reference[180..200]).
        let read1 = reference.seq(0)[10..30].to_vec();
        let mut read2 = Vec::new();
        reverse_complement(&reference.seq(0)[180..200], &mut read2);
        let mut negative1 = Vec::new();
        reverse_complement(&read1, &mut negative1);
        let mut negative2 = Vec::new();
        reverse_complement(&read2, &mut negative2);
        let span1 = ReadSpan {
            read: &read1,
            negative: &negative1,
        };
        let span2 = ReadSpan {
            read: &read2,
            negative: &negative2,
        };

        let mut pos1 = Vec::new();
        let mut neg1 = Vec::new();
        verify_candidates(
            &read1,
            &negative1,
            &[pack_rid_pos(0, 10)],
            &[],
            &reference,
            2,
            &mut pos1,
            &mut neg1,
        );
        let mut pos2 = Vec::new();
        let mut neg2 = Vec::new();
        verify_candidates(
            &read2,
            &negative2,
            &[],
            &[pack_rid_pos(0, 199)],
            &reference,
            2,
            &mut pos2,
            &mut neg2,
        );
        assert_eq!(pos1.len(), 1);
        assert_eq!(neg2.len(), 1);

        let mut f1r2_best = Vec::new();
        let mut f2r1_best = Vec::new();
        let mut pair_counts = crate::mapping::pair::PairedBestCounts::new(2);
        generate_best_mappings_on_one_direction(
            Direction::Positive,
            &pos1,
            &neg2,
            20,
            20,
            400,
            30,
            &mut f1r2_best,
            &mut pair_counts,
        );
        generate_best_mappings_on_one_direction(
            Direction::Negative,
            &neg1,
            &pos2,
            20,
            20,
            400,
            30,
            &mut f2r1_best,
            &mut pair_counts,
        );
        assert_eq!(pair_counts.num_best_mappings, 1);

        let mut rng = StdRng::seed_from_u64(11);
        let mut indices = Vec::new();
        let mut out = new_per_ref_mappings(1);
        generate_best_mappings_for_paired_end_read(
            &pair_counts,
            3,
            0,
            &span1,
            &span2,
            &reference,
            &PairedArm {
                mappings1: &pos1,
                mappings2: &neg2,
                best_mappings: &f1r2_best,
            },
            &PairedArm {
                mappings1: &neg1,
                mappings2: &pos2,
                best_mappings: &f2r1_best,
            },
            &config,
            &mut rng,
            &mut indices,
            &mut out,
        );

        assert_eq!(out[0].len(), 1);
        let rec = out[0][0];
        assert_eq!(rec.read_id, 3);
        assert_eq!(rec.fragment_start, 10);
        assert_eq!(rec.fragment_length, 190);
        assert_eq!(rec.mapq, 60);
        assert!(rec.mate1_is_positive());
        assert_eq!(rec.positive_len(), 20);
        assert_eq!(rec.negative_alignment_length, 20);
        assert!(rec.fragment_length as u32 <= config.max_insert_size);
        assert!(rec.start() + rec.len() as u32 <= reference.len(0) as u32);
    }
}
