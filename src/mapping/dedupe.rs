//! PCR duplicate removal — sort-and-unique over fragment coordinates per
//! reference sequence, plus the experimental barcode-aware identical-read
//! pre-filter applied before mapping.

use ahash::AHashMap;

use crate::mapping::record::{Mapping, PerRefMappings};

// ---------------------------------------------------------------------------
// remove_pcr_duplicates
// ---------------------------------------------------------------------------

/// Sort each reference's mappings into canonical order and keep one record
/// per run of duplicates.
///
/// The comparator is `(fragment_start, fragment_length, mapq, barcode)`;
/// records equal under it are PCR copies of the same fragment. The source
/// vectors are drained into `deduped`, and `(before, after)` record counts
/// are returned for the run summary.
pub fn remove_pcr_duplicates<R: Mapping>(
    mappings: &mut PerRefMappings<R>,
    deduped: &mut PerRefMappings<R>,
) -> (u64, u64) {
    let mut num_input = 0u64;
    let mut num_output = 0u64;
    for (per_ref, out) in mappings.iter_mut().zip(deduped.iter_mut()) {
        per_ref.sort_unstable_by(|a, b| a.dedupe_cmp(b));
        num_input += per_ref.len() as u64;
        if per_ref.is_empty() {
            continue;
        }
        out.push(per_ref[0]);
        let mut last = per_ref[0];
        for &record in per_ref.iter().skip(1) {
            if !record.is_duplicate_of(&last) {
                out.push(record);
                last = record;
            }
        }
        num_output += out.len() as u64;
        per_ref.clear();
        per_ref.shrink_to_fit();
    }
    (num_input, num_output)
}

/// Sort each reference's mappings into canonical order without removing
/// anything. Establishes the deterministic order the allocator and the
/// output pass rely on when duplicate removal is disabled.
pub fn sort_mappings<R: Mapping>(mappings: &mut PerRefMappings<R>) {
    for per_ref in mappings.iter_mut() {
        per_ref.sort_unstable_by(|a, b| a.dedupe_cmp(b));
    }
}

// ---------------------------------------------------------------------------
// IdenticalReadFilter
// ---------------------------------------------------------------------------

/// Barcode-aware identical-read pre-filter (experimental).
///
/// Two-level map: a 16 nt barcode seed keys a per-barcode table of read
/// pairs, each identified by the packed first 16 nt of both mates and
/// confirmed by the second 16 nt pair. A pair matching all seeds of a
/// previously seen pair under the same barcode is reported as a duplicate
/// before it ever reaches the mapper. This is an approximation: reads
/// differing only past the first 32 nt collide.
#[derive(Debug, Default)]
pub struct IdenticalReadFilter {
    barcode_tables: AHashMap<u32, AHashMap<u64, (u64, u64)>>,
}

impl IdenticalReadFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the pair and report whether it was already present.
    pub fn is_duplicate(
        &mut self,
        barcode_key: u32,
        read_seed_key: u64,
        second_seeds: (u64, u64),
    ) -> bool {
        let read_table = self.barcode_tables.entry(barcode_key).or_default();
        match read_table.get(&read_seed_key) {
            Some(&seen) => seen == second_seeds,
            None => {
                read_table.insert(read_seed_key, second_seeds);
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::record::{PeMapping, SeMapping, new_per_ref_mappings};

    fn pe(read_id: u32, start: u32, len: u16, mapq: u8, barcode: u32) -> PeMapping {
        PeMapping {
            read_id,
            barcode,
            fragment_start: start,
            fragment_length: len,
            mapq,
            positive_alignment_length: (len << 1) | 1,
            negative_alignment_length: len,
        }
    }

    #[test]
    fn test_three_identical_records_collapse_to_one() {
        let mut mappings = new_per_ref_mappings(1);
        mappings[0].push(pe(1, 100, 190, 60, 7));
        mappings[0].push(pe(2, 100, 190, 60, 7));
        mappings[0].push(pe(3, 100, 190, 60, 7));
        let mut deduped = new_per_ref_mappings(1);
        let (before, after) = remove_pcr_duplicates(&mut mappings, &mut deduped);
        assert_eq!(before, 3);
        assert_eq!(after, 1);
        assert_eq!(deduped[0].len(), 1);
    }

    #[test]
    fn test_distinct_barcodes_are_kept() {
        let mut mappings = new_per_ref_mappings(1);
        mappings[0].push(pe(1, 100, 190, 60, 7));
        mappings[0].push(pe(2, 100, 190, 60, 8));
        let mut deduped = new_per_ref_mappings(1);
        let (_, after) = remove_pcr_duplicates(&mut mappings, &mut deduped);
        assert_eq!(after, 2);
    }

    #[test]
    fn test_output_is_sorted_and_adjacent_unequal() {
        let mut mappings = new_per_ref_mappings(1);
        mappings[0].push(pe(5, 300, 100, 60, 0));
        mappings[0].push(pe(1, 100, 190, 60, 0));
        mappings[0].push(pe(2, 100, 190, 60, 0));
        mappings[0].push(pe(3, 100, 150, 5, 0));
        let mut deduped = new_per_ref_mappings(1);
        remove_pcr_duplicates(&mut mappings, &mut deduped);
        assert_eq!(deduped[0].len(), 3);
        for pair in deduped[0].windows(2) {
            assert_eq!(
                pair[0].dedupe_cmp(&pair[1]),
                std::cmp::Ordering::Less,
                "adjacent records must be strictly increasing"
            );
        }
    }

    #[test]
    fn test_dedupe_spans_thread_interleaving() {
        // Records from different worker buffers arrive out of order; the
        // sort makes the result independent of arrival order.
        let mut a = new_per_ref_mappings(1);
        a[0].extend([pe(2, 100, 190, 60, 0), pe(1, 50, 36, 60, 0)]);
        let mut b = new_per_ref_mappings(1);
        b[0].extend([pe(1, 50, 36, 60, 0), pe(2, 100, 190, 60, 0)]);

        let mut da = new_per_ref_mappings(1);
        let mut db = new_per_ref_mappings(1);
        remove_pcr_duplicates(&mut a, &mut da);
        remove_pcr_duplicates(&mut b, &mut db);
        assert_eq!(da[0], db[0]);
    }

    #[test]
    fn test_single_end_records() {
        let mut mappings: PerRefMappings<SeMapping> = new_per_ref_mappings(2);
        mappings[0].push(SeMapping {
            read_id: 1,
            barcode: 0,
            start: 10,
            length: 15,
            mapq: 60,
        });
        mappings[1].push(SeMapping {
            read_id: 2,
            barcode: 0,
            start: 10,
            length: 15,
            mapq: 60,
        });
        let mut deduped = new_per_ref_mappings(2);
        let (_, after) = remove_pcr_duplicates(&mut mappings, &mut deduped);
        // Same coordinates on different references are different fragments.
        assert_eq!(after, 2);
    }

    #[test]
    fn test_identical_read_filter() {
        let mut filter = IdenticalReadFilter::new();
        assert!(!filter.is_duplicate(1, 42, (7, 8)));
        assert!(filter.is_duplicate(1, 42, (7, 8)));
        // Same seeds under a different barcode: not a duplicate.
        assert!(!filter.is_duplicate(2, 42, (7, 8)));
        // Same first seeds but different confirmation pair: not a duplicate,
        // and the original entry is kept.
        assert!(!filter.is_duplicate(1, 42, (9, 9)));
        assert!(filter.is_duplicate(1, 42, (7, 8)));
    }
}
