//! Command line argument parsing for the segpatch CLI using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::lexical::config::PatchCompression;
use crate::storage::compression::DEFAULT_BLOCK_SIZE;

/// segpatch - inspect and merge segment patch files
#[derive(Parser, Debug, Clone)]
#[command(name = "segpatch")]
#[command(about = "Inspect and merge patch files of a segmented inverted index")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(long_about = None)]
pub struct SegpatchArgs {
    /// Verbosity level (0=quiet, 1=normal, 2=verbose, 3=debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (overrides verbose)
    #[arg(short, long)]
    pub quiet: bool,

    /// Output format
    #[arg(short = 'f', long = "format", default_value = "human")]
    pub output_format: OutputFormat,

    /// Pretty-print JSON output
    #[arg(long)]
    pub pretty: bool,

    /// Patch files are lz4 block compressed
    #[arg(long)]
    pub lz4: bool,

    /// Uncompressed lz4 block size the files were written with
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    pub lz4_block_size: usize,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

impl SegpatchArgs {
    /// Get the effective verbosity level
    pub fn verbosity(&self) -> u8 {
        if self.quiet {
            0
        } else {
            match self.verbose {
                0 => 1,
                n => n,
            }
        }
    }

    /// Compression the patch files were written with.
    pub fn compression(&self) -> PatchCompression {
        if self.lz4 {
            PatchCompression::Lz4 {
                block_size: self.lz4_block_size,
            }
        } else {
            PatchCompression::None
        }
    }
}

/// Available CLI commands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print the meta record and term blocks of one patch file
    Inspect(InspectArgs),

    /// Print the merged view of patch files targeting one segment
    Merge(MergeArgs),
}

/// Arguments for inspecting a patch file
#[derive(Parser, Debug, Clone)]
pub struct InspectArgs {
    /// Patch file (<src>_<dst>.patch)
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Only print the meta record
    #[arg(long)]
    pub meta_only: bool,

    /// Maximum number of terms to print
    #[arg(short, long)]
    pub limit: Option<usize>,
}

/// Arguments for merging patch files
#[derive(Parser, Debug, Clone)]
pub struct MergeArgs {
    /// Patch files sharing one destination segment
    #[arg(value_name = "FILES", required = true, num_args = 1..)]
    pub files: Vec<PathBuf>,

    /// Maximum number of terms to print
    #[arg(short, long)]
    pub limit: Option<usize>,
}

/// Output formats for CLI
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON output
    Json,
}
