//! map_info.json writer — summary statistics for a mapping run.

use std::path::Path;

use anyhow::Result;

use crate::mapping::driver::MapSummary;

/// Run metadata written alongside the summary counters.
pub struct MapInfoParams<'a> {
    pub path: &'a Path,
    /// Mapping mode: "single-end" or "paired-end".
    pub mode: &'a str,
    pub summary: &'a MapSummary,
    pub num_threads: usize,
    pub num_refs: usize,
    pub index_path: &'a Path,
    pub version: &'a str,
    pub elapsed_secs: f64,
}

/// Write a map_info.json file with mapping statistics and run metadata.
pub fn write_map_info(params: &MapInfoParams) -> Result<()> {
    let summary = params.summary;
    let percent_mapped = if summary.num_reads > 0 {
        (summary.num_mapped_reads as f64 / summary.num_reads as f64) * 100.0
    } else {
        0.0
    };
    let cmdline: Vec<String> = std::env::args().collect();

    let info = serde_json::json!({
        "mode": params.mode,
        "version": params.version,
        "index_path": params.index_path.display().to_string(),
        "num_refs": params.num_refs,
        "num_threads": params.num_threads,
        "num_reads": summary.num_reads,
        "num_mapped_reads": summary.num_mapped_reads,
        "num_uniquely_mapped_reads": summary.num_uniquely_mapped_reads,
        "num_candidates": summary.num_candidates,
        "num_mappings": summary.num_mappings,
        "num_reads_without_minimizers": summary.num_reads_without_minimizers,
        "num_too_short_reads": summary.num_too_short_reads,
        "num_identical_reads": summary.num_identical_reads,
        "percent_mapped": format!("{:.2}", percent_mapped),
        "runtime_seconds": format!("{:.2}", params.elapsed_secs),
        "cmdline": cmdline.join(" "),
    });

    let file = std::fs::File::create(params.path)?;
    let writer = std::io::BufWriter::new(file);
    serde_json::to_writer_pretty(writer, &info)?;
    Ok(())
}
