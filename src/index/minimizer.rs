//! Minimizer index — sketching, candidate generation, and the on-disk
//! format.
//!
//! The index maps each minimizer hash to its occurrence list on the
//! reference. Sketching picks the minimum invertible-hash canonical k-mer in
//! every window of `w` k-mers; candidate generation projects read minimizer
//! hits onto diagonals and clusters hits that agree within the error
//! threshold.

use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use ahash::AHashMap;
use anyhow::{Context, Result, bail};

use crate::mapping::align::base_code;
use crate::mapping::record::pack_rid_pos;

/// Magic bytes of the index file format.
const INDEX_MAGIC: &[u8; 8] = b"NCMIDX01";

// ---------------------------------------------------------------------------
// Sketching
// ---------------------------------------------------------------------------

/// A minimizer on a read: hash value, end position of the k-mer, and
/// whether the canonical k-mer is the reverse complement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadMinimizer {
    pub hash: u64,
    pub pos: u32,
    pub is_reverse: bool,
}

/// Invertible integer hash over `mask` bits (Thomas Wang's 64-bit mix).
#[inline]
fn hash64(mut key: u64, mask: u64) -> u64 {
    key = (!key).wrapping_add(key << 21) & mask;
    key ^= key >> 24;
    key = key.wrapping_add(key << 3).wrapping_add(key << 8) & mask;
    key ^= key >> 14;
    key = key.wrapping_add(key << 2).wrapping_add(key << 4) & mask;
    key ^= key >> 28;
    key = key.wrapping_add(key << 31) & mask;
    key
}

/// Sketch a sequence: the leftmost minimum-hash canonical k-mer of every
/// window of `w` consecutive k-mers.
///
/// K-mers containing non-ACGT bases and k-mers equal to their own reverse
/// complement are skipped. Consecutive windows sharing their minimizer emit
/// it once. A sequence with fewer than `w` k-mers is treated as a single
/// window so short reads still sketch.
pub fn sketch_sequence(seq: &[u8], k: usize, w: usize, out: &mut Vec<ReadMinimizer>) {
    out.clear();
    let n = seq.len();
    if n < k {
        return;
    }
    let mask = if 2 * k >= 64 {
        u64::MAX
    } else {
        (1u64 << (2 * k)) - 1
    };

    // Rolling forward and reverse-complement k-mers, with a validity run
    // length to exclude ambiguous bases.
    let num_kmers = n - k + 1;
    let mut kmer_info: Vec<Option<(u64, bool)>> = Vec::with_capacity(num_kmers);
    let mut forward = 0u64;
    let mut reverse = 0u64;
    let mut valid_len = 0usize;
    for (i, &base) in seq.iter().enumerate() {
        let code = base_code(base);
        if code < 4 {
            forward = ((forward << 2) | code as u64) & mask;
            reverse = (reverse >> 2) | (((3 ^ code) as u64) << (2 * (k - 1)));
            valid_len += 1;
        } else {
            valid_len = 0;
        }
        if i + 1 >= k {
            kmer_info.push(if valid_len >= k {
                match forward.cmp(&reverse) {
                    std::cmp::Ordering::Less => Some((hash64(forward, mask), false)),
                    std::cmp::Ordering::Greater => Some((hash64(reverse, mask), true)),
                    std::cmp::Ordering::Equal => None,
                }
            } else {
                None
            });
        }
    }

    let window = w.min(num_kmers);
    for window_start in 0..=num_kmers - window {
        let mut best: Option<(u64, usize, bool)> = None;
        for (j, info) in kmer_info
            .iter()
            .enumerate()
            .skip(window_start)
            .take(window)
        {
            if let Some((hash, is_reverse)) = *info {
                if best.is_none_or(|(best_hash, _, _)| hash < best_hash) {
                    best = Some((hash, j, is_reverse));
                }
            }
        }
        if let Some((hash, j, is_reverse)) = best {
            let pos = (j + k - 1) as u32;
            let duplicate = out
                .last()
                .is_some_and(|m| m.hash == hash && m.pos == pos && m.is_reverse == is_reverse);
            if !duplicate {
                out.push(ReadMinimizer {
                    hash,
                    pos,
                    is_reverse,
                });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// CandidateBuffers
// ---------------------------------------------------------------------------

/// Reusable per-worker buffers for hit collection and candidate output.
#[derive(Debug, Default)]
pub struct CandidateBuffers {
    pub positive_hits: Vec<u64>,
    pub negative_hits: Vec<u64>,
    pub positive: Vec<u64>,
    pub negative: Vec<u64>,
}

impl CandidateBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.positive_hits.clear();
        self.negative_hits.clear();
        self.positive.clear();
        self.negative.clear();
    }

    /// Total candidates across both strands.
    pub fn num_candidates(&self) -> usize {
        self.positive.len() + self.negative.len()
    }
}

// ---------------------------------------------------------------------------
// MinimizerIndex
// ---------------------------------------------------------------------------

/// Minimizer occurrence index over a reference.
///
/// Occurrences pack `rid << 33 | position << 1 | strand`; the table maps a
/// minimizer hash to its slice of the flat occurrence array.
#[derive(Debug, Default)]
pub struct MinimizerIndex {
    kmer_size: usize,
    window_size: usize,
    table: AHashMap<u64, (u64, u32)>,
    occurrences: Vec<u64>,
}

impl MinimizerIndex {
    /// Build the index by sketching every reference sequence.
    pub fn build(reference: &crate::index::reference::Reference, k: usize, w: usize) -> Self {
        let mut table_map: AHashMap<u64, Vec<u64>> = AHashMap::new();
        let mut minimizers = Vec::new();
        for rid in 0..reference.num_refs() as u32 {
            sketch_sequence(reference.seq(rid), k, w, &mut minimizers);
            for m in &minimizers {
                let occurrence =
                    ((rid as u64) << 33) | ((m.pos as u64) << 1) | (m.is_reverse as u64);
                table_map.entry(m.hash).or_default().push(occurrence);
            }
        }

        // Flatten in key order so the on-disk layout is deterministic.
        let mut keys: Vec<u64> = table_map.keys().copied().collect();
        keys.sort_unstable();
        let mut table = AHashMap::with_capacity(keys.len());
        let mut occurrences = Vec::new();
        for key in keys {
            let entry = &table_map[&key];
            table.insert(key, (occurrences.len() as u64, entry.len() as u32));
            occurrences.extend_from_slice(entry);
        }
        Self {
            kmer_size: k,
            window_size: w,
            table,
            occurrences,
        }
    }

    #[inline]
    pub fn kmer_size(&self) -> usize {
        self.kmer_size
    }

    #[inline]
    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Number of distinct minimizers.
    pub fn num_minimizers(&self) -> usize {
        self.table.len()
    }

    /// Sketch a read with the index's k and w.
    pub fn sketch(&self, seq: &[u8], minimizers: &mut Vec<ReadMinimizer>) {
        sketch_sequence(seq, self.kmer_size, self.window_size, minimizers);
    }

    /// Collect hits below a frequency cap. Returns whether any minimizer was
    /// skipped for being too frequent.
    fn collect_hits(
        &self,
        minimizers: &[ReadMinimizer],
        frequency_cap: u32,
        buffers: &mut CandidateBuffers,
    ) -> bool {
        let mut skipped_frequent = false;
        let k = self.kmer_size as u64;
        for m in minimizers {
            let Some(&(offset, count)) = self.table.get(&m.hash) else {
                continue;
            };
            if count > frequency_cap {
                skipped_frequent = true;
                continue;
            }
            for &occurrence in &self.occurrences[offset as usize..offset as usize + count as usize]
            {
                let rid = (occurrence >> 33) as u32;
                let ref_pos = ((occurrence >> 1) & u32::MAX as u64) as u32;
                let ref_is_reverse = occurrence & 1 == 1;
                if ref_is_reverse == m.is_reverse {
                    // Same strand: project onto the read-start diagonal.
                    if ref_pos >= m.pos {
                        buffers.positive_hits.push(pack_rid_pos(rid, ref_pos - m.pos));
                    }
                } else {
                    // Opposite strand: project onto the read-end diagonal.
                    let end = ref_pos as u64 + m.pos as u64 + 1 - k;
                    if end <= u32::MAX as u64 {
                        buffers.negative_hits.push(pack_rid_pos(rid, end as u32));
                    }
                }
            }
        }
        skipped_frequent
    }

    /// Generate candidates from a read's minimizers.
    ///
    /// Hits from minimizers above the first frequency cap are skipped; if
    /// that leaves nothing, the collection is retried with the second cap.
    /// Sorted hits agreeing within the error threshold on the same diagonal
    /// cluster into a single candidate once at least `min_num_seeds` of them
    /// agree.
    pub fn generate_candidates(
        &self,
        minimizers: &[ReadMinimizer],
        min_num_seeds: u32,
        max_seed_frequencies: [u32; 2],
        error_threshold: u32,
        buffers: &mut CandidateBuffers,
    ) {
        buffers.clear();
        let skipped = self.collect_hits(minimizers, max_seed_frequencies[0], buffers);
        if buffers.positive_hits.is_empty() && buffers.negative_hits.is_empty() && skipped {
            self.collect_hits(minimizers, max_seed_frequencies[1], buffers);
        }
        buffers.positive_hits.sort_unstable();
        buffers.negative_hits.sort_unstable();
        cluster_hits(
            &buffers.positive_hits,
            min_num_seeds,
            error_threshold as u64,
            &mut buffers.positive,
        );
        cluster_hits(
            &buffers.negative_hits,
            min_num_seeds,
            error_threshold as u64,
            &mut buffers.negative,
        );
    }

    // -----------------------------------------------------------------------
    // Serialization
    // -----------------------------------------------------------------------

    /// Write the index to a file.
    ///
    /// Format (little-endian):
    /// ```text
    /// [magic: 8 bytes "NCMIDX01"]
    /// [k: u32] [w: u32]
    /// [num_keys: u64] [num_occurrences: u64]
    /// per key, in ascending key order: [key: u64] [count: u32]
    /// [occurrences: num_occurrences × u64]
    /// ```
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)
            .with_context(|| format!("failed to create index file {}", path.display()))?;
        let mut w = BufWriter::new(file);
        w.write_all(INDEX_MAGIC)?;
        w.write_all(&(self.kmer_size as u32).to_le_bytes())?;
        w.write_all(&(self.window_size as u32).to_le_bytes())?;
        w.write_all(&(self.table.len() as u64).to_le_bytes())?;
        w.write_all(&(self.occurrences.len() as u64).to_le_bytes())?;

        let mut entries: Vec<(u64, u64, u32)> = self
            .table
            .iter()
            .map(|(&key, &(offset, count))| (offset, key, count))
            .collect();
        entries.sort_unstable();
        for &(_, key, count) in &entries {
            w.write_all(&key.to_le_bytes())?;
            w.write_all(&count.to_le_bytes())?;
        }
        for &occurrence in &self.occurrences {
            w.write_all(&occurrence.to_le_bytes())?;
        }
        w.flush()?;
        Ok(())
    }

    /// Load an index written by `save`.
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open index file {}", path.display()))?;
        let mut r = BufReader::new(file);

        let mut magic = [0u8; 8];
        r.read_exact(&mut magic).context("failed to read index magic")?;
        if magic != *INDEX_MAGIC {
            bail!(
                "invalid index magic: expected {:?}, got {:?}",
                INDEX_MAGIC,
                magic
            );
        }
        let kmer_size = read_u32_le(&mut r)? as usize;
        let window_size = read_u32_le(&mut r)? as usize;
        let num_keys = read_u64_le(&mut r)? as usize;
        let num_occurrences = read_u64_le(&mut r)? as usize;

        let mut table = AHashMap::with_capacity(num_keys);
        let mut offset = 0u64;
        for _ in 0..num_keys {
            let key = read_u64_le(&mut r)?;
            let count = read_u32_le(&mut r)?;
            table.insert(key, (offset, count));
            offset += count as u64;
        }
        if offset != num_occurrences as u64 {
            bail!(
                "index is corrupt: key counts sum to {} but {} occurrences recorded",
                offset,
                num_occurrences
            );
        }
        let mut occurrences = Vec::with_capacity(num_occurrences);
        for _ in 0..num_occurrences {
            occurrences.push(read_u64_le(&mut r)?);
        }
        Ok(Self {
            kmer_size,
            window_size,
            table,
            occurrences,
        })
    }
}

/// Emit one candidate per run of hits whose diagonals agree within the
/// error threshold, provided the run has enough support.
fn cluster_hits(hits: &[u64], min_num_seeds: u32, error_threshold: u64, out: &mut Vec<u64>) {
    let mut i = 0usize;
    while i < hits.len() {
        let mut j = i + 1;
        while j < hits.len() && hits[j] - hits[j - 1] <= error_threshold {
            j += 1;
        }
        if (j - i) as u32 >= min_num_seeds {
            out.push(hits[i]);
        }
        i = j;
    }
}

fn read_u32_le<R: Read>(reader: &mut R) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64_le<R: Read>(reader: &mut R) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::reference::Reference;
    use crate::mapping::record::{packed_pos, packed_rid};

    const REF_SEQ: &[u8] = b"TTGACCAGTCAAGGCTATCGGTCAATCCGGATTGACCTGA";

    fn test_reference() -> Reference {
        Reference::from_parts(vec!["chr1".to_string()], vec![REF_SEQ.to_vec()])
    }

    #[test]
    fn test_sketch_deterministic_and_positioned() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        sketch_sequence(REF_SEQ, 7, 3, &mut a);
        sketch_sequence(REF_SEQ, 7, 3, &mut b);
        assert_eq!(a, b);
        assert!(!a.is_empty());
        for m in &a {
            assert!(m.pos >= 6);
            assert!((m.pos as usize) < REF_SEQ.len());
        }
        // Positions are non-decreasing and duplicates collapsed.
        for pair in a.windows(2) {
            assert!(pair[0].pos < pair[1].pos || pair[0].hash != pair[1].hash);
        }
    }

    #[test]
    fn test_sketch_skips_ambiguous_bases() {
        let mut minimizers = Vec::new();
        sketch_sequence(b"ACGTNNNNACGT", 5, 2, &mut minimizers);
        assert!(minimizers.is_empty());
    }

    #[test]
    fn test_sketch_short_read_single_window() {
        let mut minimizers = Vec::new();
        // 8 bases, k=7: two k-mers, fewer than w=5 — one window.
        sketch_sequence(&REF_SEQ[..8], 7, 5, &mut minimizers);
        assert_eq!(minimizers.len(), 1);
    }

    #[test]
    fn test_candidates_for_embedded_read() {
        let reference = test_reference();
        let index = MinimizerIndex::build(&reference, 7, 3);
        let read = &REF_SEQ[10..25];

        let mut minimizers = Vec::new();
        index.sketch(read, &mut minimizers);
        assert!(!minimizers.is_empty());

        let mut buffers = CandidateBuffers::new();
        index.generate_candidates(&minimizers, 1, [1000, 5000], 2, &mut buffers);
        assert!(
            buffers.positive.contains(&pack_rid_pos(0, 10)),
            "expected a positive candidate at the read start, got {:?}",
            buffers
                .positive
                .iter()
                .map(|&c| (packed_rid(c), packed_pos(c)))
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_candidates_for_reverse_complement_read() {
        let reference = test_reference();
        let index = MinimizerIndex::build(&reference, 7, 3);
        let mut read = Vec::new();
        crate::io::batch::reverse_complement(&REF_SEQ[10..25], &mut read);

        let mut minimizers = Vec::new();
        index.sketch(&read, &mut minimizers);
        assert!(!minimizers.is_empty());

        let mut buffers = CandidateBuffers::new();
        index.generate_candidates(&minimizers, 1, [1000, 5000], 2, &mut buffers);
        // The read's reverse complement spans [10, 25): predicted end 24.
        assert!(
            buffers.negative.contains(&pack_rid_pos(0, 24)),
            "expected a negative candidate at the read end, got {:?}",
            buffers
                .negative
                .iter()
                .map(|&c| (packed_rid(c), packed_pos(c)))
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_min_num_seeds_filters_lone_hits() {
        let reference = test_reference();
        let index = MinimizerIndex::build(&reference, 7, 3);
        let read = &REF_SEQ[10..25];
        let mut minimizers = Vec::new();
        index.sketch(read, &mut minimizers);

        let mut permissive = CandidateBuffers::new();
        index.generate_candidates(&minimizers, 1, [1000, 5000], 2, &mut permissive);
        let mut strict = CandidateBuffers::new();
        index.generate_candidates(&minimizers, u32::MAX, [1000, 5000], 2, &mut strict);
        assert!(permissive.num_candidates() > 0);
        assert_eq!(strict.num_candidates(), 0);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let reference = test_reference();
        let index = MinimizerIndex::build(&reference, 7, 3);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ref.idx");
        index.save(&path).unwrap();

        let loaded = MinimizerIndex::load(&path).unwrap();
        assert_eq!(loaded.kmer_size(), 7);
        assert_eq!(loaded.window_size(), 3);
        assert_eq!(loaded.num_minimizers(), index.num_minimizers());

        let read = &REF_SEQ[10..25];
        let mut minimizers = Vec::new();
        index.sketch(read, &mut minimizers);
        let mut from_built = CandidateBuffers::new();
        index.generate_candidates(&minimizers, 1, [1000, 5000], 2, &mut from_built);
        let mut from_loaded = CandidateBuffers::new();
        loaded.generate_candidates(&minimizers, 1, [1000, 5000], 2, &mut from_loaded);
        assert_eq!(from_built.positive, from_loaded.positive);
        assert_eq!(from_built.negative, from_loaded.negative);
    }

    #[test]
    fn test_load_rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.idx");
        std::fs::write(&path, b"NOTANIDXxxxxxxxxxxxxxxxx").unwrap();
        let result = MinimizerIndex::load(&path);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("invalid index magic"));
    }
}
