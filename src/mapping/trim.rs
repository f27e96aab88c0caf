//! Adapter trimming — detects read-through into the sequencing adapter by
//! overlapping mate 1 with the reverse complement of mate 2.
//!
//! A seed of half the minimum read length, taken from mate 1 at shift 0 or
//! one seed length in, is searched in the reverse complement of mate 2; each
//! hit is extended to the full putative overlap and accepted with at most
//! one mismatch. On success both mates are trimmed to the overlap length.

/// Find the first occurrence of `needle` in `haystack` at or after `from`.
fn find_from(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || haystack.len() < from + needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Detect the 3' overlap between `read1` and the reverse complement of
/// mate 2 (`negative_read2`).
///
/// Returns the overlap length both mates should be trimmed to, or `None` if
/// no confirmed overlap exists. The overlap must span at least
/// `min_read_length` bases and fit within both reads.
pub fn adapter_overlap(
    read1: &[u8],
    negative_read2: &[u8],
    min_read_length: usize,
) -> Option<usize> {
    let min_overlap_length = min_read_length;
    let seed_length = min_overlap_length / 2;
    let error_threshold_for_merging = 1usize;
    let read2_length = negative_read2.len();

    for si in 0..=error_threshold_for_merging {
        if read1.len() < (si + 1) * seed_length {
            break;
        }
        let seed = &read1[si * seed_length..(si + 1) * seed_length];
        let mut seed_start_position = find_from(negative_read2, seed, 0);
        while let Some(seed_start) = seed_start_position {
            let overlap_length = read2_length - seed_start + si * seed_length;
            if overlap_length >= min_overlap_length
                && overlap_length <= read1.len()
                && seed_start >= si * seed_length
            {
                let mut num_errors = 0usize;
                let mut can_merge = true;
                // Bases before the seed.
                for i in 0..si * seed_length {
                    if negative_read2[seed_start - si * seed_length + i] != read1[i] {
                        num_errors += 1;
                    }
                    if num_errors > error_threshold_for_merging {
                        can_merge = false;
                        break;
                    }
                }
                // Bases from the seed end through the 3' end of mate 2.
                if can_merge {
                    for i in seed_length..read2_length - seed_start {
                        if negative_read2[seed_start + i] != read1[si * seed_length + i] {
                            num_errors += 1;
                        }
                        if num_errors > error_threshold_for_merging {
                            can_merge = false;
                            break;
                        }
                    }
                }
                if can_merge {
                    return Some(overlap_length);
                }
            }
            seed_start_position = find_from(negative_read2, seed, seed_start + 1);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::batch::reverse_complement;

    fn synthetic_sequence(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                b"ACGT"[(state >> 60) as usize & 3]
            })
            .collect()
    }

    /// Build a mate pair reading through a short fragment into adapters:
    /// mate 1 = fragment + adapter1, mate 2 = revcomp(fragment) + adapter2.
    fn read_through_pair(fragment_len: usize, read_len: usize) -> (Vec<u8>, Vec<u8>) {
        let fragment = synthetic_sequence(fragment_len, 0xA076_1D64_78BD_642F);
        let adapter1 = b"AGATCGGAAGAGCACACGTCTGAACTCCAGTCAC".to_vec();
        let adapter2 = b"AGATCGGAAGAGCGTCGTGTAGGGAAAGAGTGTA".to_vec();

        let mut read1 = fragment.clone();
        read1.extend_from_slice(&adapter1);
        read1.truncate(read_len);

        let mut read2 = Vec::new();
        reverse_complement(&fragment, &mut read2);
        read2.extend_from_slice(&adapter2);
        read2.truncate(read_len);

        (read1, read2)
    }

    #[test]
    fn test_detects_read_through_overlap() {
        let (read1, read2) = read_through_pair(40, 50);
        let mut negative_read2 = Vec::new();
        reverse_complement(&read2, &mut negative_read2);

        let overlap = adapter_overlap(&read1, &negative_read2, 30);
        assert_eq!(overlap, Some(40));
    }

    #[test]
    fn test_tolerates_one_mismatch() {
        let (mut read1, read2) = read_through_pair(40, 50);
        // One sequencing error outside the seed region.
        read1[25] = match read1[25] {
            b'A' => b'C',
            _ => b'A',
        };
        let mut negative_read2 = Vec::new();
        reverse_complement(&read2, &mut negative_read2);

        let overlap = adapter_overlap(&read1, &negative_read2, 30);
        assert_eq!(overlap, Some(40));
    }

    #[test]
    fn test_no_overlap_for_long_fragment() {
        // Fragment longer than both reads: no read-through, nothing to trim.
        let fragment = synthetic_sequence(200, 0xA076_1D64_78BD_642F);
        let read1 = fragment[..50].to_vec();
        let mut read2 = Vec::new();
        reverse_complement(&fragment[150..], &mut read2);
        let mut negative_read2 = Vec::new();
        reverse_complement(&read2, &mut negative_read2);

        assert_eq!(adapter_overlap(&read1, &negative_read2, 30), None);
    }

    #[test]
    fn test_short_coincidental_match_is_rejected() {
        // A seed hit too close to the 3' end of mate 2 cannot reach the
        // minimum overlap length.
        let (read1, _) = read_through_pair(40, 50);
        let mut negative_read2 = synthetic_sequence(30, 0x5851_F42D_4C95_7F2D);
        negative_read2.extend_from_slice(&read1[..15]);
        // Overlap would be 50 - 30 = 20 < 30.
        assert_eq!(adapter_overlap(&read1, &negative_read2, 30), None);
    }
}
