//! Read mapping core — candidate verification, pair resolution, best-mapping
//! selection, duplicate removal, multi-mapping allocation, and the batched
//! pipeline driver.

pub mod align;
pub mod allocate;
pub mod dedupe;
pub mod driver;
pub mod mapq;
pub mod pair;
pub mod record;
pub mod select;
pub mod trim;
pub mod verify;

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Mapping strand of a read: positive means the read aligns to the forward
/// reference strand, negative means its reverse complement does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Positive,
    Negative,
}

// ---------------------------------------------------------------------------
// MapConfig
// ---------------------------------------------------------------------------

/// Mapping configuration.
///
/// Defaults mirror the CLI defaults; `validated()` applies the internal
/// consistency rules and must be called before the config reaches the
/// pipeline driver.
#[derive(Debug, Clone)]
pub struct MapConfig {
    /// Maximum number of errors for a read to map (`E`).
    pub error_threshold: usize,
    /// Minimum number of agreeing seed hits to form a candidate.
    pub min_num_seeds: u32,
    /// Seed-frequency caps: minimizers above the first cap are skipped, the
    /// second cap is the fallback when the first yields nothing.
    pub max_seed_frequencies: [u32; 2],
    /// Cap on reported best mappings per read (reservoir sample size).
    pub max_num_best_mappings: usize,
    /// Maximum insert size for paired-end pairing.
    pub max_insert_size: u32,
    pub num_threads: usize,
    /// Reads shorter than this are dropped at load time.
    pub min_read_length: usize,
    /// Seed for the reservoir-sampling and allocation PRNGs.
    pub multi_mapping_allocation_seed: u64,
    /// Reads with more best mappings than this are dropped entirely.
    pub drop_repetitive_reads: usize,
    /// Reads (or pairs) per batch.
    pub batch_size: u32,
    pub trim_adapters: bool,
    pub remove_pcr_duplicates: bool,
    pub is_bulk_data: bool,
    pub allocate_multi_mappings: bool,
    pub only_output_unique_mappings: bool,
    /// Single-cell identical-read pre-filter (experimental).
    pub skip_identical_reads: bool,
    /// Shift fragments +4/−5 to center on the Tn5 insertion site.
    pub tn5_shift: bool,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            error_threshold: 3,
            min_num_seeds: 2,
            max_seed_frequencies: [1000, 5000],
            max_num_best_mappings: 10,
            max_insert_size: 400,
            num_threads: 1,
            min_read_length: 30,
            multi_mapping_allocation_seed: 11,
            drop_repetitive_reads: 500_000,
            batch_size: 1_000_000,
            trim_adapters: false,
            remove_pcr_duplicates: false,
            is_bulk_data: true,
            allocate_multi_mappings: false,
            only_output_unique_mappings: false,
            skip_identical_reads: false,
            tn5_shift: false,
        }
    }
}

impl MapConfig {
    /// Apply internal consistency rules.
    ///
    /// `max_num_best_mappings` is clamped to `drop_repetitive_reads`; the
    /// CLI is responsible for telling the user about it.
    pub fn validated(mut self) -> Self {
        if self.max_num_best_mappings > self.drop_repetitive_reads {
            self.max_num_best_mappings = self.drop_repetitive_reads;
        }
        self
    }

    /// MAPQ threshold applied when emitting records.
    pub fn output_mapq_threshold(&self) -> u8 {
        if self.allocate_multi_mappings || self.only_output_unique_mappings {
            30
        } else {
            0
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
