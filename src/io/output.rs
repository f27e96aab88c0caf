//! Mapping output — TagAlign and fragment/BED text writers over the
//! per-reference record containers.

use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};

use crate::index::reference::Reference;
use crate::mapping::record::{PeMapping, PerRefMappings, SeMapping};

/// Output line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Paired TagAlign: two `name start end N 1000 strand` lines per
    /// fragment, positive mate first.
    TagAlign,
    /// Fragment records: `name start length [barcode]`.
    Bed,
}

/// Buffered text writer for mapping records.
pub struct OutputWriter {
    writer: BufWriter<std::fs::File>,
    format: OutputFormat,
    /// Barcode length in bases; zero disables the barcode column.
    barcode_length: usize,
}

impl OutputWriter {
    pub fn create(path: &Path, format: OutputFormat, barcode_length: usize) -> Result<Self> {
        let file = std::fs::File::create(path)
            .with_context(|| format!("failed to create output file {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
            format,
            barcode_length,
        })
    }

    /// Write paired-end records with MAPQ at or above the threshold.
    pub fn write_paired_end_mappings(
        &mut self,
        mappings: &PerRefMappings<PeMapping>,
        mapq_threshold: u8,
        reference: &Reference,
    ) -> Result<()> {
        for (ri, per_ref) in mappings.iter().enumerate() {
            let name = reference.name(ri as u32);
            for record in per_ref {
                if record.mapq < mapq_threshold {
                    continue;
                }
                match self.format {
                    OutputFormat::TagAlign => {
                        let positive_read_end =
                            record.fragment_start + record.positive_len() as u32;
                        let negative_read_end =
                            record.fragment_start + record.fragment_length as u32;
                        let negative_read_start =
                            negative_read_end - record.negative_alignment_length as u32;
                        writeln!(
                            self.writer,
                            "{}\t{}\t{}\tN\t1000\t+",
                            name, record.fragment_start, positive_read_end
                        )?;
                        writeln!(
                            self.writer,
                            "{}\t{}\t{}\tN\t1000\t-",
                            name, negative_read_start, negative_read_end
                        )?;
                    }
                    OutputFormat::Bed => {
                        if self.barcode_length > 0 {
                            writeln!(
                                self.writer,
                                "{}\t{}\t{}\t{}",
                                name,
                                record.fragment_start,
                                record.fragment_length,
                                decode_barcode(record.barcode, self.barcode_length)
                            )?;
                        } else {
                            writeln!(
                                self.writer,
                                "{}\t{}\t{}",
                                name, record.fragment_start, record.fragment_length
                            )?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Write single-end records with MAPQ at or above the threshold.
    ///
    /// Single-end records carry no strand, so they are emitted as BED3
    /// intervals regardless of the configured format.
    pub fn write_single_end_mappings(
        &mut self,
        mappings: &PerRefMappings<SeMapping>,
        mapq_threshold: u8,
        reference: &Reference,
    ) -> Result<()> {
        for (ri, per_ref) in mappings.iter().enumerate() {
            let name = reference.name(ri as u32);
            for record in per_ref {
                if record.mapq < mapq_threshold {
                    continue;
                }
                writeln!(
                    self.writer,
                    "{}\t{}\t{}",
                    name,
                    record.start,
                    record.start + record.length as u32
                )?;
            }
        }
        Ok(())
    }

    pub fn finish(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Decode a 2-bit packed barcode key back to bases. A `u32` key holds at
/// most 16 bases; longer barcodes keep their last 16.
fn decode_barcode(key: u32, length: usize) -> String {
    let length = length.min(16);
    (0..length)
        .map(|i| {
            let shift = 2 * (length - 1 - i);
            b"ACGT"[((key >> shift) & 3) as usize] as char
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
