//! CLI command for read mapping.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Args;
use tracing::{info, warn};

use crate::index::minimizer::MinimizerIndex;
use crate::index::reference::Reference;
use crate::io::batch::{BatchLoader, FastqStream};
use crate::io::map_info::{MapInfoParams, write_map_info};
use crate::io::output::{OutputFormat, OutputWriter};
use crate::mapping::MapConfig;
use crate::mapping::driver::{map_paired_end_reads, map_single_end_reads};

#[derive(Args, Debug)]
pub struct MapArgs {
    /// Index file built by `nucleomap index`
    #[arg(short = 'x', long)]
    pub index: PathBuf,
    /// Reference FASTA file
    #[arg(short = 'r', long)]
    pub reference: PathBuf,
    /// Single-end read file, or paired-end read file 1
    #[arg(short = '1', long)]
    pub read1: String,
    /// Paired-end read file 2
    #[arg(short = '2', long)]
    pub read2: Option<String>,
    /// Cell barcode file (single-cell data)
    #[arg(short = 'b', long)]
    pub barcode: Option<String>,
    /// Output file
    #[arg(short = 'o', long)]
    pub output: PathBuf,
    /// Max number of errors allowed to map a read
    #[arg(short = 'e', long, default_value = "3")]
    pub error_threshold: usize,
    /// Expected k-mer length of the index (checked against the index file)
    #[arg(short = 'k', long)]
    pub kmer: Option<usize>,
    /// Expected window size of the index (checked against the index file)
    #[arg(short = 'w', long)]
    pub window: Option<usize>,
    /// Min number of agreeing seeds to form a candidate
    #[arg(short = 's', long, default_value = "2")]
    pub min_num_seeds: u32,
    /// Seed frequency caps (first pass, fallback)
    #[arg(short = 'f', long, value_delimiter = ',', default_values_t = [1000u32, 5000u32])]
    pub max_seed_frequencies: Vec<u32>,
    /// Only report up to this many best mappings
    #[arg(short = 'n', long, default_value = "10")]
    pub max_num_best_mappings: usize,
    /// Max insert size for paired-end mapping
    #[arg(short = 'l', long, default_value = "400")]
    pub max_insert_size: u32,
    /// Number of mapping threads
    #[arg(short = 't', long, default_value = "1")]
    pub num_threads: usize,
    /// Drop reads shorter than this
    #[arg(long, default_value = "30")]
    pub min_read_length: usize,
    /// Seed for the multi-mapping allocation PRNG
    #[arg(long, default_value = "11")]
    pub multi_mapping_allocation_seed: u64,
    /// Drop reads with more best mappings than this
    #[arg(long, default_value = "500000")]
    pub drop_repetitive_reads: usize,
    /// Reads (or pairs) per batch
    #[arg(long, default_value = "1000000")]
    pub batch_size: u32,
    /// Try to trim adapters on the 3' end
    #[arg(long)]
    pub trim_adapters: bool,
    /// Remove PCR duplicates after mapping
    #[arg(long)]
    pub remove_pcr_duplicates: bool,
    /// Allocate multi-mappings after mapping
    #[arg(long)]
    pub allocate_multi_mappings: bool,
    /// Only output unique mappings
    #[arg(long = "unique-mappings")]
    pub only_output_unique_mappings: bool,
    /// Drop identical read pairs before mapping (experimental, single-cell)
    #[arg(long)]
    pub skip_identical_reads: bool,
    /// Shift fragments +4/-5 onto the Tn5 insertion sites (paired-end)
    #[arg(long)]
    pub tn5_shift: bool,
    /// Output format (tagalign or bed)
    #[arg(long, default_value = "tagalign")]
    pub output_format: String,
    /// Barcode length in bases, for the fragment output column
    #[arg(long, default_value = "16")]
    pub barcode_length: usize,
}

pub fn run(args: MapArgs) -> Result<()> {
    let start = Instant::now();

    let output_format = match args.output_format.to_lowercase().as_str() {
        "tagalign" => OutputFormat::TagAlign,
        "bed" => OutputFormat::Bed,
        other => anyhow::bail!("unknown output format: {}", other),
    };
    anyhow::ensure!(
        args.max_seed_frequencies.len() == 2,
        "expected two seed frequency caps, got {}",
        args.max_seed_frequencies.len()
    );

    if args.allocate_multi_mappings && args.only_output_unique_mappings {
        warn!(
            "both --allocate-multi-mappings and --unique-mappings given; \
             only unique mappings will be output"
        );
    }
    if args.max_num_best_mappings > args.drop_repetitive_reads {
        warn!(
            "--max-num-best-mappings {} exceeds --drop-repetitive-reads {}; \
             only {} best mappings will be reported",
            args.max_num_best_mappings, args.drop_repetitive_reads, args.drop_repetitive_reads
        );
    }

    let is_paired = args.read2.is_some();
    let is_bulk = args.barcode.is_none();
    info!(
        "Mapping {} {} reads",
        if is_paired { "paired-end" } else { "single-end" },
        if is_bulk { "bulk" } else { "single-cell" },
    );

    info!("Loading reference from {}", args.reference.display());
    let reference = Reference::load(&args.reference)?;
    info!("Loading index from {}", args.index.display());
    let index = MinimizerIndex::load(&args.index)?;
    info!(
        "Index loaded: k={}, w={}, {} refs",
        index.kmer_size(),
        index.window_size(),
        reference.num_refs()
    );
    if let Some(k) = args.kmer {
        anyhow::ensure!(
            k == index.kmer_size(),
            "index was built with k={} but k={} was requested",
            index.kmer_size(),
            k
        );
    }
    if let Some(w) = args.window {
        anyhow::ensure!(
            w == index.window_size(),
            "index was built with w={} but w={} was requested",
            index.window_size(),
            w
        );
    }

    let config = MapConfig {
        error_threshold: args.error_threshold,
        min_num_seeds: args.min_num_seeds,
        max_seed_frequencies: [args.max_seed_frequencies[0], args.max_seed_frequencies[1]],
        max_num_best_mappings: args.max_num_best_mappings,
        max_insert_size: args.max_insert_size,
        num_threads: args.num_threads,
        min_read_length: args.min_read_length,
        multi_mapping_allocation_seed: args.multi_mapping_allocation_seed,
        drop_repetitive_reads: args.drop_repetitive_reads,
        batch_size: args.batch_size,
        trim_adapters: args.trim_adapters,
        remove_pcr_duplicates: args.remove_pcr_duplicates,
        is_bulk_data: is_bulk,
        allocate_multi_mappings: args.allocate_multi_mappings,
        only_output_unique_mappings: args.only_output_unique_mappings,
        skip_identical_reads: args.skip_identical_reads,
        tn5_shift: args.tn5_shift,
    }
    .validated();

    let stream1 = FastqStream::open(&args.read1)?;
    let stream2 = args.read2.as_deref().map(FastqStream::open).transpose()?;
    let barcode_stream = args.barcode.as_deref().map(FastqStream::open).transpose()?;
    let mut loader = BatchLoader::new(
        stream1,
        stream2,
        barcode_stream,
        config.batch_size,
        config.min_read_length,
        config.skip_identical_reads,
    );

    let barcode_column = if is_bulk { 0 } else { args.barcode_length };
    let mut output = OutputWriter::create(&args.output, output_format, barcode_column)
        .with_context(|| format!("failed to open output {}", args.output.display()))?;

    let summary = if is_paired {
        map_paired_end_reads(&config, &reference, &index, &mut loader, &mut output)?
    } else {
        map_single_end_reads(&config, &reference, &index, &mut loader, &mut output)?
    };

    let elapsed = start.elapsed().as_secs_f64();
    info!(
        "Done: {}/{} reads mapped ({} unique, {} candidates, {} mappings) in {:.1}s",
        summary.num_mapped_reads,
        summary.num_reads,
        summary.num_uniquely_mapped_reads,
        summary.num_candidates,
        summary.num_mappings,
        elapsed
    );

    let info_path = args.output.with_extension("map_info.json");
    write_map_info(&MapInfoParams {
        path: &info_path,
        mode: if is_paired { "paired-end" } else { "single-end" },
        summary: &summary,
        num_threads: config.num_threads,
        num_refs: reference.num_refs(),
        index_path: &args.index,
        version: crate::VERSION,
        elapsed_secs: elapsed,
    })?;

    Ok(())
}
