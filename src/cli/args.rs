use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::engine::Topology;

#[derive(Parser)]
#[command(name = "image_pipeline")]
#[command(about = "A concurrent multi-stage image processing pipeline")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the pipeline over the images in a directory
    Run {
        /// Directory containing the source images
        target_directory: PathBuf,

        /// Pipeline topology to assemble
        #[arg(short, long, value_enum, default_value = "linear")]
        topology: TopologyArg,

        /// Maximum number of in-flight items
        #[arg(short, long, default_value = "20")]
        capacity: usize,

        /// Number of parallel workers for the balanced stage
        #[arg(short, long)]
        workers: Option<usize>,

        /// Stop after this many items (loops over the directory forever otherwise)
        #[arg(short = 'n', long)]
        limit: Option<u64>,

        /// Noise amount applied by the filter stage (0.0 - 1.0)
        #[arg(long, default_value = "0.3")]
        noise: f64,

        /// Maximum display width images are scaled down to
        #[arg(long, default_value = "640")]
        width: u32,

        /// Maximum display height images are scaled down to
        #[arg(long, default_value = "480")]
        height: u32,

        /// Write a JSON run report to this file
        #[arg(short, long)]
        report: Option<PathBuf>,

        /// Suppress per-item console output
        #[arg(short, long)]
        quiet: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TopologyArg {
    /// Single loop without concurrency
    Sequential,
    /// One worker per stage, chained by channels
    Linear,
    /// Parallel workers for the filter stage plus order restoration
    Balanced,
}

impl From<TopologyArg> for Topology {
    fn from(arg: TopologyArg) -> Self {
        match arg {
            TopologyArg::Sequential => Topology::Sequential,
            TopologyArg::Linear => Topology::Linear,
            TopologyArg::Balanced => Topology::Balanced,
        }
    }
}
