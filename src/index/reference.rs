//! Reference genome — named sequences loaded whole from a FASTA file.
//!
//! Immutable after load; shared read-only by every worker thread.

use std::path::Path;

use anyhow::{Context, Result, bail};
use paraseq::Record;
use paraseq::fasta;

/// An in-memory reference: parallel vectors of sequence names and bases,
/// indexed by 0-based reference id.
#[derive(Debug, Clone, Default)]
pub struct Reference {
    names: Vec<String>,
    sequences: Vec<Vec<u8>>,
}

impl Reference {
    /// Load every sequence of a (possibly compressed) FASTA file.
    pub fn load(path: &Path) -> Result<Self> {
        let (reader, _format) = niffler::send::from_path(path)
            .with_context(|| format!("failed to open reference {}", path.display()))?;
        let mut fasta_reader = fasta::Reader::new(reader);
        let mut record_set = fasta_reader.new_record_set();

        let mut names = Vec::new();
        let mut sequences = Vec::new();
        while record_set.fill(&mut fasta_reader)? {
            for record in record_set.iter() {
                let record = record?;
                let name = std::str::from_utf8(record.id())
                    .context("reference name is not valid UTF-8")?
                    .split_ascii_whitespace()
                    .next()
                    .unwrap_or("")
                    .to_string();
                names.push(name);
                sequences.push(record.seq().into_owned());
            }
        }
        if names.is_empty() {
            bail!("reference {} contains no sequences", path.display());
        }
        Ok(Self { names, sequences })
    }

    /// Build a reference directly from names and sequences.
    ///
    /// # Panics
    /// Panics if the vectors differ in length.
    pub fn from_parts(names: Vec<String>, sequences: Vec<Vec<u8>>) -> Self {
        assert_eq!(
            names.len(),
            sequences.len(),
            "Reference: names ({}) and sequences ({}) must have equal length",
            names.len(),
            sequences.len()
        );
        Self { names, sequences }
    }

    /// Number of reference sequences.
    #[inline]
    pub fn num_refs(&self) -> usize {
        self.names.len()
    }

    /// Name of reference `rid`.
    #[inline]
    pub fn name(&self, rid: u32) -> &str {
        &self.names[rid as usize]
    }

    /// Length of reference `rid` in bases.
    #[inline]
    pub fn len(&self, rid: u32) -> usize {
        self.sequences[rid as usize].len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Forward-strand bases of reference `rid`.
    #[inline]
    pub fn seq(&self, rid: u32) -> &[u8] {
        &self.sequences[rid as usize]
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
