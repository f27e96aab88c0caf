//! CLI command for building the minimizer index.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use clap::Args;
use tracing::info;

use crate::index::minimizer::MinimizerIndex;
use crate::index::reference::Reference;

#[derive(Args, Debug)]
pub struct IndexArgs {
    /// Reference FASTA file
    #[arg(short = 'r', long)]
    pub reference: PathBuf,
    /// Output index file
    #[arg(short = 'o', long)]
    pub output: PathBuf,
    /// K-mer length
    #[arg(short = 'k', long, default_value = "17")]
    pub kmer: usize,
    /// Minimizer window size
    #[arg(short = 'w', long, default_value = "5")]
    pub window: usize,
}

pub fn run(args: IndexArgs) -> Result<()> {
    let start = Instant::now();
    info!(
        "Building index: k={}, w={}, reference {}",
        args.kmer,
        args.window,
        args.reference.display()
    );

    let reference = Reference::load(&args.reference)?;
    info!("Loaded {} reference sequences", reference.num_refs());

    let index = MinimizerIndex::build(&reference, args.kmer, args.window);
    info!("Indexed {} distinct minimizers", index.num_minimizers());

    index.save(&args.output)?;
    info!(
        "Saved index to {} in {:.1}s",
        args.output.display(),
        start.elapsed().as_secs_f64()
    );
    Ok(())
}
