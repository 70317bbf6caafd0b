//! CLI command definitions and dispatch.

mod clean;
mod images;
mod merge;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use imagemerge_core::MergeConfig;

/// imagemerge - merge container images into a single-layer image.
#[derive(Parser)]
#[command(name = "imagemerge", version, about)]
pub struct Cli {
    /// Configuration file (default: ~/.imagemerge/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log progress at info level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Merge two or more images into one, earlier sources winning conflicts
    Merge(merge::MergeArgs),
    /// List images in the local store
    Images(images::ImagesArgs),
    /// Remove work directories preserved by failed merges
    Clean(clean::CleanArgs),
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = MergeConfig::load(cli.config.as_deref())?;
    match cli.command {
        Command::Merge(args) => merge::execute(args, config).await,
        Command::Images(args) => images::execute(args, config).await,
        Command::Clean(args) => clean::execute(args, config).await,
    }
}
