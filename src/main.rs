use anyhow::Result;
use clap::Parser;

use image_pipeline::cli::{execute_run, Cli, Commands, RunOptions};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            target_directory,
            topology,
            capacity,
            workers,
            limit,
            noise,
            width,
            height,
            report,
            quiet,
        } => {
            execute_run(RunOptions {
                target_directory,
                topology: topology.into(),
                capacity,
                workers,
                limit,
                noise,
                width,
                height,
                report,
                quiet,
            })
            .await
        }
    }
}
