//! Herald - unified CLI entrypoint.
//!
//! Usage:
//!   herald start --config config/herald.toml

use anyhow::Result;
use clap::Parser;
use herald::cli::{run_start, Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => run_start(args).await,
    }
}
