//! Tether - live backup of a working directory
//!
//! Main binary entry point for the command-line interface.

use clap::Parser;
use tether::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Watch(args) => tether::cli::watch::run(args).await,
        Commands::Drives(args) => tether::cli::drives::run(args).await,
        Commands::Sync(args) => tether::cli::sync::run(args).await,
        Commands::Config(args) => tether::cli::config::run(args).await,
    }
}
