//! Pipeline driver — the batched mapping loop.
//!
//! One task loads the next batch of reads while a pool of workers maps the
//! current batch; per-thread per-reference buffers keep the hot path free of
//! shared mutable state. Between batches the worker buffers are swapped with
//! a shadow set whose drain into the global containers overlaps the next
//! batch's mapping. After the last batch come the post-passes: PCR duplicate
//! removal, multi-mapping allocation, and the final output scan.
//!
//! Uses crossbeam scoped threads so workers can borrow the reference, the
//! index, and the active batches without `Arc`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::Result;
use crossbeam::channel;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::info;

use crate::index::minimizer::{CandidateBuffers, MinimizerIndex, ReadMinimizer};
use crate::index::reference::Reference;
use crate::io::batch::{BatchLoader, SequenceBatch, generate_seed, reverse_complement};
use crate::io::output::OutputWriter;
use crate::mapping::MapConfig;
use crate::mapping::dedupe::{remove_pcr_duplicates, sort_mappings};
use crate::mapping::pair::{
    PairedBestCounts, generate_best_mappings_on_one_direction,
    reduce_candidates_for_paired_end_read,
};
use crate::mapping::record::{Mapping, PeMapping, PerRefMappings, SeMapping, new_per_ref_mappings};
use crate::mapping::select::{
    PairedArm, ReadSpan, generate_best_mappings_for_paired_end_read,
    generate_best_mappings_for_single_end_read,
};
use crate::mapping::trim::adapter_overlap;
use crate::mapping::verify::{Alignment, verify_candidates};
use crate::mapping::{Direction, allocate::allocate_multi_mappings};

/// Reads handed to a worker per task.
const CHUNK_GRAIN_SIZE: u32 = 10_000;

// ---------------------------------------------------------------------------
// MappingStats
// ---------------------------------------------------------------------------

/// Thread-safe mapping statistics, reduced once per worker chunk.
#[derive(Default)]
pub struct MappingStats {
    pub num_reads: AtomicU64,
    pub num_mapped_reads: AtomicU64,
    pub num_uniquely_mapped_reads: AtomicU64,
    pub num_candidates: AtomicU64,
    pub num_mappings: AtomicU64,
    pub num_reads_without_minimizers: AtomicU64,
}

impl MappingStats {
    pub fn new() -> Self {
        Self::default()
    }
}

/// End-of-run summary, combining the worker statistics with the loader's
/// counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct MapSummary {
    pub num_reads: u64,
    pub num_mapped_reads: u64,
    pub num_uniquely_mapped_reads: u64,
    pub num_candidates: u64,
    pub num_mappings: u64,
    pub num_reads_without_minimizers: u64,
    pub num_too_short_reads: u64,
    pub num_identical_reads: u64,
}

impl MapSummary {
    fn from_stats(stats: &MappingStats, loader: &BatchLoader) -> Self {
        Self {
            num_reads: stats.num_reads.load(Ordering::Relaxed),
            num_mapped_reads: stats.num_mapped_reads.load(Ordering::Relaxed),
            num_uniquely_mapped_reads: stats.num_uniquely_mapped_reads.load(Ordering::Relaxed),
            num_candidates: stats.num_candidates.load(Ordering::Relaxed),
            num_mappings: stats.num_mappings.load(Ordering::Relaxed),
            num_reads_without_minimizers: stats
                .num_reads_without_minimizers
                .load(Ordering::Relaxed),
            num_too_short_reads: loader.num_too_short_reads,
            num_identical_reads: loader.num_identical_reads,
        }
    }
}

// ---------------------------------------------------------------------------
// Worker state
// ---------------------------------------------------------------------------

/// Per-worker scratch buffers, reused across reads and batches.
struct WorkerState {
    rng: StdRng,
    negative1: Vec<u8>,
    negative2: Vec<u8>,
    minimizers1: Vec<ReadMinimizer>,
    minimizers2: Vec<ReadMinimizer>,
    candidates1: CandidateBuffers,
    candidates2: CandidateBuffers,
    reduced_positive1: Vec<u64>,
    reduced_negative1: Vec<u64>,
    reduced_positive2: Vec<u64>,
    reduced_negative2: Vec<u64>,
    positive_mappings1: Vec<Alignment>,
    negative_mappings1: Vec<Alignment>,
    positive_mappings2: Vec<Alignment>,
    negative_mappings2: Vec<Alignment>,
    f1r2_best_mappings: Vec<(u32, u32)>,
    f2r1_best_mappings: Vec<(u32, u32)>,
    best_mapping_indices: Vec<usize>,
}

impl WorkerState {
    fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            negative1: Vec::new(),
            negative2: Vec::new(),
            minimizers1: Vec::new(),
            minimizers2: Vec::new(),
            candidates1: CandidateBuffers::new(),
            candidates2: CandidateBuffers::new(),
            reduced_positive1: Vec::new(),
            reduced_negative1: Vec::new(),
            reduced_positive2: Vec::new(),
            reduced_negative2: Vec::new(),
            positive_mappings1: Vec::new(),
            negative_mappings1: Vec::new(),
            positive_mappings2: Vec::new(),
            negative_mappings2: Vec::new(),
            f1r2_best_mappings: Vec::new(),
            f2r1_best_mappings: Vec::new(),
            best_mapping_indices: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Buffer plumbing
// ---------------------------------------------------------------------------

/// Append every thread-local buffer into the global per-reference vectors
/// and clear it for reuse.
fn drain_thread_buffers<R: Mapping>(
    thread_buffers: &mut [PerRefMappings<R>],
    global: &mut PerRefMappings<R>,
) {
    for buffers in thread_buffers.iter_mut() {
        for (per_ref, global_ref) in buffers.iter_mut().zip(global.iter_mut()) {
            global_ref.append(per_ref);
        }
    }
}

/// Pre-reserve per-thread per-reference buffers so steady-state pushes stay
/// amortized O(1).
fn reserve_thread_buffers<R: Mapping>(
    thread_buffers: &mut [PerRefMappings<R>],
    batch_size: u32,
    max_num_best_mappings: usize,
    num_threads: usize,
    num_refs: usize,
) {
    let slots = (batch_size as usize + batch_size as usize / 1000 * max_num_best_mappings)
        / num_threads.max(1)
        / num_refs.max(1);
    for buffers in thread_buffers.iter_mut() {
        for per_ref in buffers.iter_mut() {
            per_ref.reserve(slots);
        }
    }
}

// ---------------------------------------------------------------------------
// Tn5 shift
// ---------------------------------------------------------------------------

/// Shift paired-end fragments +4 / −5 to center them on the transposase
/// insertion sites. Fragments too short to shift are left unchanged.
fn apply_tn5_shift(mappings: &mut PerRefMappings<PeMapping>) {
    for per_ref in mappings.iter_mut() {
        for record in per_ref.iter_mut() {
            if record.fragment_length > 9
                && record.positive_len() > 4
                && record.negative_alignment_length > 5
            {
                record.fragment_start += 4;
                record.fragment_length -= 9;
                record.positive_alignment_length -= 4 << 1;
                record.negative_alignment_length -= 5;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Paired-end pipeline
// ---------------------------------------------------------------------------

/// Map one chunk of read pairs into the worker's per-reference buffers.
#[allow(clippy::too_many_arguments)]
fn process_pair_chunk(
    range: (u32, u32),
    batch1: &SequenceBatch,
    batch2: &SequenceBatch,
    barcodes: &SequenceBatch,
    reference: &Reference,
    index: &MinimizerIndex,
    config: &MapConfig,
    state: &mut WorkerState,
    buffers: &mut PerRefMappings<PeMapping>,
    stats: &MappingStats,
) {
    let mut local_candidates = 0u64;
    let mut local_mappings = 0u64;
    let mut local_mapped = 0u64;
    let mut local_unique = 0u64;
    let mut local_no_minimizers = 0u64;

    for pair_index in range.0..range.1 {
        let i = pair_index as usize;
        let seq1 = batch1.seq(i);
        let seq2 = batch2.seq(i);
        reverse_complement(seq1, &mut state.negative1);
        reverse_complement(seq2, &mut state.negative2);

        // Adapter trimming shortens both mates to the confirmed overlap;
        // the trimmed negative sequence is a suffix of the full one.
        let mut read1: &[u8] = seq1;
        let mut read2: &[u8] = seq2;
        let mut negative1: &[u8] = &state.negative1;
        let mut negative2: &[u8] = &state.negative2;
        if config.trim_adapters {
            if let Some(overlap) = adapter_overlap(seq1, negative2, config.min_read_length) {
                read1 = &seq1[..overlap];
                negative1 = &state.negative1[seq1.len() - overlap..];
                read2 = &seq2[..overlap];
                negative2 = &state.negative2[seq2.len() - overlap..];
            }
        }

        index.sketch(read1, &mut state.minimizers1);
        index.sketch(read2, &mut state.minimizers2);
        if state.minimizers1.is_empty() || state.minimizers2.is_empty() {
            local_no_minimizers += 1;
            continue;
        }

        index.generate_candidates(
            &state.minimizers1,
            config.min_num_seeds,
            config.max_seed_frequencies,
            config.error_threshold as u32,
            &mut state.candidates1,
        );
        index.generate_candidates(
            &state.minimizers2,
            config.min_num_seeds,
            config.max_seed_frequencies,
            config.error_threshold as u32,
            &mut state.candidates2,
        );
        if state.candidates1.num_candidates() == 0 || state.candidates2.num_candidates() == 0 {
            continue;
        }

        state.reduced_positive1.clear();
        state.reduced_negative1.clear();
        state.reduced_positive2.clear();
        state.reduced_negative2.clear();
        reduce_candidates_for_paired_end_read(
            &state.candidates1.positive,
            &state.candidates1.negative,
            &state.candidates2.positive,
            &state.candidates2.negative,
            config.max_insert_size,
            &mut state.reduced_positive1,
            &mut state.reduced_negative1,
            &mut state.reduced_positive2,
            &mut state.reduced_negative2,
        );
        local_candidates += (state.reduced_positive1.len()
            + state.reduced_negative1.len()
            + state.reduced_positive2.len()
            + state.reduced_negative2.len()) as u64;

        state.positive_mappings1.clear();
        state.negative_mappings1.clear();
        state.positive_mappings2.clear();
        state.negative_mappings2.clear();
        verify_candidates(
            read1,
            negative1,
            &state.reduced_positive1,
            &state.reduced_negative1,
            reference,
            config.error_threshold,
            &mut state.positive_mappings1,
            &mut state.negative_mappings1,
        );
        verify_candidates(
            read2,
            negative2,
            &state.reduced_positive2,
            &state.reduced_negative2,
            reference,
            config.error_threshold,
            &mut state.positive_mappings2,
            &mut state.negative_mappings2,
        );
        if state.positive_mappings1.len() + state.negative_mappings1.len() == 0
            || state.positive_mappings2.len() + state.negative_mappings2.len() == 0
        {
            continue;
        }

        state.f1r2_best_mappings.clear();
        state.f2r1_best_mappings.clear();
        let mut pair_counts = PairedBestCounts::new(config.error_threshold);
        generate_best_mappings_on_one_direction(
            Direction::Positive,
            &state.positive_mappings1,
            &state.negative_mappings2,
            read1.len() as u32,
            read2.len() as u32,
            config.max_insert_size,
            config.min_read_length as u32,
            &mut state.f1r2_best_mappings,
            &mut pair_counts,
        );
        generate_best_mappings_on_one_direction(
            Direction::Negative,
            &state.negative_mappings1,
            &state.positive_mappings2,
            read1.len() as u32,
            read2.len() as u32,
            config.max_insert_size,
            config.min_read_length as u32,
            &mut state.f2r1_best_mappings,
            &mut pair_counts,
        );

        let barcode_key = if config.is_bulk_data || barcodes.is_empty() {
            0
        } else {
            let barcode = barcodes.seq(i);
            generate_seed(barcode, 0, barcode.len()) as u32
        };
        generate_best_mappings_for_paired_end_read(
            &pair_counts,
            batch1.read_id(i),
            barcode_key,
            &ReadSpan {
                read: read1,
                negative: negative1,
            },
            &ReadSpan {
                read: read2,
                negative: negative2,
            },
            reference,
            &PairedArm {
                mappings1: &state.positive_mappings1,
                mappings2: &state.negative_mappings2,
                best_mappings: &state.f1r2_best_mappings,
            },
            &PairedArm {
                mappings1: &state.negative_mappings1,
                mappings2: &state.positive_mappings2,
                best_mappings: &state.f2r1_best_mappings,
            },
            config,
            &mut state.rng,
            &mut state.best_mapping_indices,
            buffers,
        );

        if pair_counts.num_best_mappings > 0 {
            local_mapped += 1;
            local_mappings +=
                (pair_counts.num_best_mappings as usize).min(config.max_num_best_mappings) as u64;
            if pair_counts.num_best_mappings == 1 {
                local_unique += 1;
            }
        }
    }

    stats
        .num_candidates
        .fetch_add(local_candidates, Ordering::Relaxed);
    stats
        .num_mappings
        .fetch_add(local_mappings, Ordering::Relaxed);
    stats
        .num_mapped_reads
        .fetch_add(local_mapped, Ordering::Relaxed);
    stats
        .num_uniquely_mapped_reads
        .fetch_add(local_unique, Ordering::Relaxed);
    stats
        .num_reads_without_minimizers
        .fetch_add(local_no_minimizers, Ordering::Relaxed);
}

/// Map paired-end reads end to end and write the accepted fragments.
pub fn map_paired_end_reads(
    config: &MapConfig,
    reference: &Reference,
    index: &MinimizerIndex,
    loader: &mut BatchLoader,
    output: &mut OutputWriter,
) -> Result<MapSummary> {
    let start_time = Instant::now();
    let num_refs = reference.num_refs();
    let num_threads = config.num_threads.max(1);

    let mut global: PerRefMappings<PeMapping> = new_per_ref_mappings(num_refs);
    let mut thread_buffers: Vec<PerRefMappings<PeMapping>> =
        (0..num_threads).map(|_| new_per_ref_mappings(num_refs)).collect();
    let mut saving_buffers: Vec<PerRefMappings<PeMapping>> =
        (0..num_threads).map(|_| new_per_ref_mappings(num_refs)).collect();
    reserve_thread_buffers(
        &mut thread_buffers,
        config.batch_size,
        config.max_num_best_mappings,
        num_threads,
        num_refs,
    );
    reserve_thread_buffers(
        &mut saving_buffers,
        config.batch_size,
        config.max_num_best_mappings,
        num_threads,
        num_refs,
    );
    let mut worker_states: Vec<WorkerState> = (0..num_threads)
        .map(|_| WorkerState::new(config.multi_mapping_allocation_seed))
        .collect();
    let stats = MappingStats::new();

    let mut batch1 = SequenceBatch::new();
    let mut batch2 = SequenceBatch::new();
    let mut barcode_batch = SequenceBatch::new();
    let mut batch1_for_loading = SequenceBatch::new();
    let mut batch2_for_loading = SequenceBatch::new();
    let mut barcode_batch_for_loading = SequenceBatch::new();

    let mut num_loaded = loader.load_paired_end_batch(
        &mut batch1_for_loading,
        &mut batch2_for_loading,
        &mut barcode_batch_for_loading,
    )?;
    std::mem::swap(&mut batch1, &mut batch1_for_loading);
    std::mem::swap(&mut batch2, &mut batch2_for_loading);
    std::mem::swap(&mut barcode_batch, &mut barcode_batch_for_loading);

    while num_loaded > 0 {
        let batch_start_time = Instant::now();
        stats.num_reads.fetch_add(num_loaded as u64, Ordering::Relaxed);

        let mut load_result: Result<u32> = Ok(0);
        {
            let batch1 = &batch1;
            let batch2 = &batch2;
            let barcode_batch = &barcode_batch;
            let stats = &stats;
            let global = &mut global;
            let saving_buffers = &mut saving_buffers;
            let load_result = &mut load_result;
            let loader = &mut *loader;
            let batch1_for_loading = &mut batch1_for_loading;
            let batch2_for_loading = &mut batch2_for_loading;
            let barcode_batch_for_loading = &mut barcode_batch_for_loading;

            crossbeam::scope(|scope| {
                // Load the next batch while this one is being mapped.
                scope.spawn(move |_| {
                    *load_result = loader.load_paired_end_batch(
                        batch1_for_loading,
                        batch2_for_loading,
                        barcode_batch_for_loading,
                    );
                });
                // Drain the previous batch's buffers concurrently.
                scope.spawn(move |_| {
                    drain_thread_buffers(saving_buffers, global);
                });

                let (sender, receiver) = channel::unbounded::<(u32, u32)>();
                for (state, buffers) in
                    worker_states.iter_mut().zip(thread_buffers.iter_mut())
                {
                    let receiver = receiver.clone();
                    scope.spawn(move |_| {
                        while let Ok(range) = receiver.recv() {
                            process_pair_chunk(
                                range,
                                batch1,
                                batch2,
                                barcode_batch,
                                reference,
                                index,
                                config,
                                state,
                                buffers,
                                stats,
                            );
                        }
                    });
                }
                drop(receiver);

                let mut chunk_start = 0u32;
                while chunk_start < num_loaded {
                    let chunk_end = (chunk_start + CHUNK_GRAIN_SIZE).min(num_loaded);
                    if sender.send((chunk_start, chunk_end)).is_err() {
                        break;
                    }
                    chunk_start = chunk_end;
                }
                drop(sender);
            })
            .map_err(|e| anyhow::anyhow!("mapping thread panicked: {:?}", e))?;
        }

        num_loaded = std::mem::replace(&mut load_result, Ok(0))?;
        std::mem::swap(&mut batch1, &mut batch1_for_loading);
        std::mem::swap(&mut batch2, &mut batch2_for_loading);
        std::mem::swap(&mut barcode_batch, &mut barcode_batch_for_loading);
        std::mem::swap(&mut thread_buffers, &mut saving_buffers);

        info!(
            "Mapped batch in {:.1}s",
            batch_start_time.elapsed().as_secs_f64()
        );
    }
    drain_thread_buffers(&mut saving_buffers, &mut global);

    if config.tn5_shift {
        apply_tn5_shift(&mut global);
    }

    let mut deduped: PerRefMappings<PeMapping> = new_per_ref_mappings(num_refs);
    let mappings = if config.remove_pcr_duplicates {
        let (before, after) = remove_pcr_duplicates(&mut global, &mut deduped);
        info!("Removed PCR duplicates: {} of {} mappings left", after, before);
        &deduped
    } else {
        if config.allocate_multi_mappings {
            // Canonical order keeps allocation independent of thread count.
            sort_mappings(&mut global);
        }
        &global
    };

    let mut allocated: PerRefMappings<PeMapping> = new_per_ref_mappings(num_refs);
    if config.allocate_multi_mappings {
        let num_allocated = allocate_multi_mappings(
            mappings,
            config.multi_mapping_allocation_seed,
            &mut allocated,
        );
        info!("Allocated {} multi-mappings", num_allocated);
    }

    output.write_paired_end_mappings(mappings, config.output_mapq_threshold(), reference)?;
    if config.allocate_multi_mappings && !config.only_output_unique_mappings {
        output.write_paired_end_mappings(&allocated, 0, reference)?;
    }
    output.finish()?;

    let summary = MapSummary::from_stats(&stats, loader);
    info!(
        "Mapped {}/{} read pairs ({} unique) in {:.1}s",
        summary.num_mapped_reads,
        summary.num_reads,
        summary.num_uniquely_mapped_reads,
        start_time.elapsed().as_secs_f64()
    );
    Ok(summary)
}

// ---------------------------------------------------------------------------
// Single-end pipeline
// ---------------------------------------------------------------------------

/// Map one chunk of single-end reads into the worker's buffers.
#[allow(clippy::too_many_arguments)]
fn process_single_chunk(
    range: (u32, u32),
    batch: &SequenceBatch,
    barcodes: &SequenceBatch,
    reference: &Reference,
    index: &MinimizerIndex,
    config: &MapConfig,
    state: &mut WorkerState,
    buffers: &mut PerRefMappings<SeMapping>,
    stats: &MappingStats,
) {
    let mut local_candidates = 0u64;
    let mut local_mappings = 0u64;
    let mut local_mapped = 0u64;
    let mut local_unique = 0u64;
    let mut local_no_minimizers = 0u64;

    for read_index in range.0..range.1 {
        let i = read_index as usize;
        let read = batch.seq(i);
        reverse_complement(read, &mut state.negative1);

        index.sketch(read, &mut state.minimizers1);
        if state.minimizers1.is_empty() {
            local_no_minimizers += 1;
            continue;
        }
        index.generate_candidates(
            &state.minimizers1,
            config.min_num_seeds,
            config.max_seed_frequencies,
            config.error_threshold as u32,
            &mut state.candidates1,
        );
        if state.candidates1.num_candidates() == 0 {
            continue;
        }
        local_candidates += state.candidates1.num_candidates() as u64;

        state.positive_mappings1.clear();
        state.negative_mappings1.clear();
        let counts = verify_candidates(
            read,
            &state.negative1,
            &state.candidates1.positive,
            &state.candidates1.negative,
            reference,
            config.error_threshold,
            &mut state.positive_mappings1,
            &mut state.negative_mappings1,
        );
        if state.positive_mappings1.len() + state.negative_mappings1.len() == 0 {
            continue;
        }

        let barcode_key = if config.is_bulk_data || barcodes.is_empty() {
            0
        } else {
            let barcode = barcodes.seq(i);
            generate_seed(barcode, 0, barcode.len()) as u32
        };
        generate_best_mappings_for_single_end_read(
            &counts,
            batch.read_id(i),
            barcode_key,
            &ReadSpan {
                read,
                negative: &state.negative1,
            },
            reference,
            &state.positive_mappings1,
            &state.negative_mappings1,
            config,
            &mut state.rng,
            &mut state.best_mapping_indices,
            buffers,
        );

        local_mapped += 1;
        local_mappings +=
            (counts.num_best_mappings as usize).min(config.max_num_best_mappings) as u64;
        if counts.num_best_mappings == 1 {
            local_unique += 1;
        }
    }

    stats
        .num_candidates
        .fetch_add(local_candidates, Ordering::Relaxed);
    stats
        .num_mappings
        .fetch_add(local_mappings, Ordering::Relaxed);
    stats
        .num_mapped_reads
        .fetch_add(local_mapped, Ordering::Relaxed);
    stats
        .num_uniquely_mapped_reads
        .fetch_add(local_unique, Ordering::Relaxed);
    stats
        .num_reads_without_minimizers
        .fetch_add(local_no_minimizers, Ordering::Relaxed);
}

/// Map single-end reads end to end and write the accepted records.
pub fn map_single_end_reads(
    config: &MapConfig,
    reference: &Reference,
    index: &MinimizerIndex,
    loader: &mut BatchLoader,
    output: &mut OutputWriter,
) -> Result<MapSummary> {
    let start_time = Instant::now();
    let num_refs = reference.num_refs();
    let num_threads = config.num_threads.max(1);

    let mut global: PerRefMappings<SeMapping> = new_per_ref_mappings(num_refs);
    let mut thread_buffers: Vec<PerRefMappings<SeMapping>> =
        (0..num_threads).map(|_| new_per_ref_mappings(num_refs)).collect();
    let mut saving_buffers: Vec<PerRefMappings<SeMapping>> =
        (0..num_threads).map(|_| new_per_ref_mappings(num_refs)).collect();
    reserve_thread_buffers(
        &mut thread_buffers,
        config.batch_size,
        config.max_num_best_mappings,
        num_threads,
        num_refs,
    );
    let mut worker_states: Vec<WorkerState> = (0..num_threads)
        .map(|_| WorkerState::new(config.multi_mapping_allocation_seed))
        .collect();
    let stats = MappingStats::new();

    let mut batch = SequenceBatch::new();
    let mut barcode_batch = SequenceBatch::new();
    let mut batch_for_loading = SequenceBatch::new();
    let mut barcode_batch_for_loading = SequenceBatch::new();

    let mut num_loaded =
        loader.load_single_end_batch(&mut batch_for_loading, &mut barcode_batch_for_loading)?;
    std::mem::swap(&mut batch, &mut batch_for_loading);
    std::mem::swap(&mut barcode_batch, &mut barcode_batch_for_loading);

    while num_loaded > 0 {
        stats.num_reads.fetch_add(num_loaded as u64, Ordering::Relaxed);

        let mut load_result: Result<u32> = Ok(0);
        {
            let batch = &batch;
            let barcode_batch = &barcode_batch;
            let stats = &stats;
            let global = &mut global;
            let saving_buffers = &mut saving_buffers;
            let load_result = &mut load_result;
            let loader = &mut *loader;
            let batch_for_loading = &mut batch_for_loading;
            let barcode_batch_for_loading = &mut barcode_batch_for_loading;

            crossbeam::scope(|scope| {
                scope.spawn(move |_| {
                    *load_result =
                        loader.load_single_end_batch(batch_for_loading, barcode_batch_for_loading);
                });
                scope.spawn(move |_| {
                    drain_thread_buffers(saving_buffers, global);
                });

                let (sender, receiver) = channel::unbounded::<(u32, u32)>();
                for (state, buffers) in
                    worker_states.iter_mut().zip(thread_buffers.iter_mut())
                {
                    let receiver = receiver.clone();
                    scope.spawn(move |_| {
                        while let Ok(range) = receiver.recv() {
                            process_single_chunk(
                                range,
                                batch,
                                barcode_batch,
                                reference,
                                index,
                                config,
                                state,
                                buffers,
                                stats,
                            );
                        }
                    });
                }
                drop(receiver);

                let mut chunk_start = 0u32;
                while chunk_start < num_loaded {
                    let chunk_end = (chunk_start + CHUNK_GRAIN_SIZE).min(num_loaded);
                    if sender.send((chunk_start, chunk_end)).is_err() {
                        break;
                    }
                    chunk_start = chunk_end;
                }
                drop(sender);
            })
            .map_err(|e| anyhow::anyhow!("mapping thread panicked: {:?}", e))?;
        }

        num_loaded = std::mem::replace(&mut load_result, Ok(0))?;
        std::mem::swap(&mut batch, &mut batch_for_loading);
        std::mem::swap(&mut barcode_batch, &mut barcode_batch_for_loading);
        std::mem::swap(&mut thread_buffers, &mut saving_buffers);
    }
    drain_thread_buffers(&mut saving_buffers, &mut global);

    let mut deduped: PerRefMappings<SeMapping> = new_per_ref_mappings(num_refs);
    let mappings = if config.remove_pcr_duplicates {
        let (before, after) = remove_pcr_duplicates(&mut global, &mut deduped);
        info!("Removed PCR duplicates: {} of {} mappings left", after, before);
        &deduped
    } else {
        if config.allocate_multi_mappings {
            sort_mappings(&mut global);
        }
        &global
    };

    let mut allocated: PerRefMappings<SeMapping> = new_per_ref_mappings(num_refs);
    if config.allocate_multi_mappings {
        let num_allocated = allocate_multi_mappings(
            mappings,
            config.multi_mapping_allocation_seed,
            &mut allocated,
        );
        info!("Allocated {} multi-mappings", num_allocated);
    }

    output.write_single_end_mappings(mappings, config.output_mapq_threshold(), reference)?;
    if config.allocate_multi_mappings && !config.only_output_unique_mappings {
        output.write_single_end_mappings(&allocated, 0, reference)?;
    }
    output.finish()?;

    let summary = MapSummary::from_stats(&stats, loader);
    info!(
        "Mapped {}/{} reads ({} unique) in {:.1}s",
        summary.num_mapped_reads,
        summary.num_reads,
        summary.num_uniquely_mapped_reads,
        start_time.elapsed().as_secs_f64()
    );
    Ok(summary)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn pe(start: u32, len: u16, pos_len: u16, neg_len: u16) -> PeMapping {
        PeMapping {
            read_id: 0,
            barcode: 0,
            fragment_start: start,
            fragment_length: len,
            mapq: 60,
            positive_alignment_length: (pos_len << 1) | 1,
            negative_alignment_length: neg_len,
        }
    }

    #[test]
    fn test_drain_appends_and_clears() {
        let mut thread_buffers = vec![new_per_ref_mappings(2), new_per_ref_mappings(2)];
        thread_buffers[0][0].push(pe(10, 100, 20, 20));
        thread_buffers[1][0].push(pe(50, 100, 20, 20));
        thread_buffers[1][1].push(pe(70, 100, 20, 20));
        let mut global = new_per_ref_mappings(2);
        drain_thread_buffers(&mut thread_buffers, &mut global);
        assert_eq!(global[0].len(), 2);
        assert_eq!(global[1].len(), 1);
        assert!(thread_buffers.iter().all(|b| b.iter().all(Vec::is_empty)));
    }

    #[test]
    fn test_tn5_shift() {
        let mut mappings = new_per_ref_mappings(1);
        mappings[0].push(pe(100, 190, 20, 20));
        mappings[0].push(pe(100, 8, 3, 4)); // too short to shift
        apply_tn5_shift(&mut mappings);

        let shifted = mappings[0][0];
        assert_eq!(shifted.fragment_start, 104);
        assert_eq!(shifted.fragment_length, 181);
        assert!(shifted.mate1_is_positive());
        assert_eq!(shifted.positive_len(), 16);
        assert_eq!(shifted.negative_alignment_length, 15);

        let unshifted = mappings[0][1];
        assert_eq!(unshifted.fragment_start, 100);
        assert_eq!(unshifted.fragment_length, 8);
    }

    #[test]
    fn test_stats_reduction() {
        let stats = MappingStats::new();
        stats.num_reads.fetch_add(100, Ordering::Relaxed);
        stats.num_mapped_reads.fetch_add(80, Ordering::Relaxed);
        stats.num_uniquely_mapped_reads.fetch_add(60, Ordering::Relaxed);
        assert_eq!(stats.num_reads.load(Ordering::Relaxed), 100);
        assert_eq!(stats.num_mapped_reads.load(Ordering::Relaxed), 80);
        assert_eq!(stats.num_uniquely_mapped_reads.load(Ordering::Relaxed), 60);
    }
}
