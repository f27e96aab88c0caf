//! Batched FASTQ input — buffered streams, the sequence batch the workers
//! read from, and the loader that keeps one, two, or three streams in step.
//!
//! Wraps `paraseq` record sets with `niffler` transparent decompression,
//! following the same reader pattern as the reference loader.

use std::collections::VecDeque;

use anyhow::{Context, Result, bail};
use paraseq::Record;
use paraseq::fastq;

use crate::mapping::align::base_code;
use crate::mapping::dedupe::IdenticalReadFilter;

/// Seed length (in bases) used by the identical-read pre-filter.
const DEDUPE_SEED_LENGTH: usize = 16;

// ---------------------------------------------------------------------------
// Sequence helpers
// ---------------------------------------------------------------------------

/// Reverse-complement `seq` into `out`. Ambiguous bases become `N`.
pub fn reverse_complement(seq: &[u8], out: &mut Vec<u8>) {
    out.clear();
    out.extend(seq.iter().rev().map(|&base| match base {
        b'A' | b'a' => b'T',
        b'C' | b'c' => b'G',
        b'G' | b'g' => b'C',
        b'T' | b't' => b'A',
        _ => b'N',
    }));
}

/// Pack `seq[start..end]` two bits per base into a `u64`.
///
/// The range is clamped to the sequence length; ambiguous bases contribute
/// their low two code bits. Used for barcode keys and dedupe seeds, so only
/// stability matters, not reversibility.
pub fn generate_seed(seq: &[u8], start: usize, end: usize) -> u64 {
    let mut key = 0u64;
    for &base in &seq[start.min(seq.len())..end.min(seq.len())] {
        key = (key << 2) | (base_code(base) as u64 & 3);
    }
    key
}

// ---------------------------------------------------------------------------
// SequenceBatch
// ---------------------------------------------------------------------------

/// Owned storage for one batch of reads: global read ids and sequence bytes.
#[derive(Debug, Default)]
pub struct SequenceBatch {
    ids: Vec<u32>,
    seqs: Vec<Vec<u8>>,
}

impl SequenceBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.ids.clear();
        self.seqs.clear();
    }

    pub fn push(&mut self, id: u32, seq: Vec<u8>) {
        self.ids.push(id);
        self.seqs.push(seq);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Sequence bytes of read `i`.
    #[inline]
    pub fn seq(&self, i: usize) -> &[u8] {
        &self.seqs[i]
    }

    /// Global read id of read `i`.
    #[inline]
    pub fn read_id(&self, i: usize) -> u32 {
        self.ids[i]
    }
}

// ---------------------------------------------------------------------------
// FastqStream
// ---------------------------------------------------------------------------

/// A FASTQ stream yielding one sequence at a time across record-set
/// boundaries.
pub struct FastqStream {
    reader: fastq::Reader<Box<dyn std::io::Read + Send>>,
    record_set: fastq::RecordSet,
    buffered: VecDeque<Vec<u8>>,
    finished: bool,
}

impl FastqStream {
    /// Open a FASTQ file with automatic decompression.
    pub fn open(path: &str) -> Result<Self> {
        let (raw, _format) = niffler::send::from_path(path)
            .with_context(|| format!("failed to open {}", path))?;
        let reader = fastq::Reader::new(raw);
        let record_set = reader.new_record_set();
        Ok(Self {
            reader,
            record_set,
            buffered: VecDeque::new(),
            finished: false,
        })
    }

    /// Next sequence, or `None` at end of input.
    pub fn next_seq(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buffered.is_empty() && !self.finished {
            if self.record_set.fill(&mut self.reader)? {
                for record in self.record_set.iter() {
                    let record = record?;
                    self.buffered.push_back(record.seq().into_owned());
                }
            } else {
                self.finished = true;
            }
        }
        Ok(self.buffered.pop_front())
    }
}

// ---------------------------------------------------------------------------
// BatchLoader
// ---------------------------------------------------------------------------

/// Loads batches of reads, keeping the read and barcode streams in step.
///
/// Reads shorter than the minimum length are dropped and counted; streams
/// reaching end-of-file out of step is fatal. With the identical-read
/// filter enabled, pairs whose barcode and read seeds were already seen are
/// dropped before mapping.
pub struct BatchLoader {
    stream1: FastqStream,
    stream2: Option<FastqStream>,
    barcode_stream: Option<FastqStream>,
    batch_size: u32,
    min_read_length: usize,
    identical_filter: Option<IdenticalReadFilter>,
    next_read_id: u32,
    pub num_too_short_reads: u64,
    pub num_identical_reads: u64,
}

impl BatchLoader {
    pub fn new(
        stream1: FastqStream,
        stream2: Option<FastqStream>,
        barcode_stream: Option<FastqStream>,
        batch_size: u32,
        min_read_length: usize,
        skip_identical_reads: bool,
    ) -> Self {
        let identical_filter = (skip_identical_reads && stream2.is_some())
            .then(IdenticalReadFilter::new);
        Self {
            stream1,
            stream2,
            barcode_stream,
            batch_size,
            min_read_length,
            identical_filter,
            next_read_id: 0,
            num_too_short_reads: 0,
            num_identical_reads: 0,
        }
    }

    /// Load up to `batch_size` single-end reads. Returns the number loaded;
    /// zero means end of input.
    pub fn load_single_end_batch(
        &mut self,
        batch: &mut SequenceBatch,
        barcodes: &mut SequenceBatch,
    ) -> Result<u32> {
        batch.clear();
        barcodes.clear();
        let mut num_loaded = 0u32;
        while num_loaded < self.batch_size {
            let read = self.stream1.next_seq()?;
            let barcode = match self.barcode_stream.as_mut() {
                Some(stream) => stream.next_seq()?,
                None => None,
            };
            match (read, barcode) {
                (Some(seq), barcode) => {
                    if self.barcode_stream.is_some() && barcode.is_none() {
                        bail!("numbers of reads and barcodes don't match");
                    }
                    if seq.len() < self.min_read_length {
                        self.num_too_short_reads += 1;
                        continue;
                    }
                    let id = self.next_read_id;
                    self.next_read_id += 1;
                    batch.push(id, seq);
                    barcodes.push(id, barcode.unwrap_or_default());
                    num_loaded += 1;
                }
                (None, None) => break,
                (None, Some(_)) => bail!("numbers of reads and barcodes don't match"),
            }
        }
        Ok(num_loaded)
    }

    /// Load up to `batch_size` read pairs. Returns the number loaded; zero
    /// means end of input.
    pub fn load_paired_end_batch(
        &mut self,
        batch1: &mut SequenceBatch,
        batch2: &mut SequenceBatch,
        barcodes: &mut SequenceBatch,
    ) -> Result<u32> {
        batch1.clear();
        batch2.clear();
        barcodes.clear();
        let stream2 = self
            .stream2
            .as_mut()
            .context("paired-end loading requires a second read stream")?;

        let mut num_loaded = 0u32;
        while num_loaded < self.batch_size {
            let read1 = self.stream1.next_seq()?;
            let read2 = stream2.next_seq()?;
            let barcode = match self.barcode_stream.as_mut() {
                Some(stream) => stream.next_seq()?,
                None => None,
            };
            let barcode_exhausted = self.barcode_stream.is_some() && barcode.is_none();
            match (read1, read2) {
                (Some(seq1), Some(seq2)) => {
                    if barcode_exhausted {
                        bail!("numbers of reads and barcodes don't match");
                    }
                    if seq1.len() < self.min_read_length || seq2.len() < self.min_read_length {
                        self.num_too_short_reads += 1;
                        continue;
                    }
                    if let (Some(filter), Some(barcode)) =
                        (self.identical_filter.as_mut(), barcode.as_deref())
                    {
                        let barcode_key =
                            generate_seed(barcode, 0, DEDUPE_SEED_LENGTH) as u32;
                        let read_seed_key = (generate_seed(&seq1, 0, DEDUPE_SEED_LENGTH)
                            << (DEDUPE_SEED_LENGTH * 2))
                            | generate_seed(&seq2, 0, DEDUPE_SEED_LENGTH);
                        let second_seeds = (
                            generate_seed(&seq1, DEDUPE_SEED_LENGTH, DEDUPE_SEED_LENGTH * 2),
                            generate_seed(&seq2, DEDUPE_SEED_LENGTH, DEDUPE_SEED_LENGTH * 2),
                        );
                        if filter.is_duplicate(barcode_key, read_seed_key, second_seeds) {
                            self.num_identical_reads += 1;
                            continue;
                        }
                    }
                    let id = self.next_read_id;
                    self.next_read_id += 1;
                    batch1.push(id, seq1);
                    batch2.push(id, seq2);
                    barcodes.push(id, barcode.unwrap_or_default());
                    num_loaded += 1;
                }
                (None, None) => {
                    if self.barcode_stream.is_some() && barcode.is_some() {
                        bail!("numbers of reads and barcodes don't match");
                    }
                    break;
                }
                _ => bail!("numbers of read1 and read2 records don't match"),
            }
        }
        Ok(num_loaded)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
