pub mod index;
pub mod map;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "nucleomap")]
#[command(about = "A short-read mapper for chromatin biology")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build a minimizer index for a reference genome
    Index(index::IndexArgs),
    /// Map reads against an indexed reference
    Map(map::MapArgs),
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Index(args) => index::run(args),
        Commands::Map(args) => map::run(args),
    }
}
