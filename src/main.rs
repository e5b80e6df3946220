//! Hostplane - unified CLI entrypoint.
//!
//! Usage:
//!   hostplane start --config config/hostplane.toml
//!   hostplane config validate --config config/hostplane.toml
//!   hostplane tables --version 1.83.0
//!   hostplane hash-password

use anyhow::Result;
use clap::Parser;
use hostplane::cli::commands::{run_config, run_hash_password, run_start_with_config, run_tables};
use hostplane::cli::{Cli, Commands};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/hostplane.toml"));

    match cli.command {
        Commands::Start(args) => run_start_with_config(&config_path, cli.log_level, args).await,
        Commands::Config(args) => run_config(args),
        Commands::Tables(args) => run_tables(args),
        Commands::HashPassword(args) => run_hash_password(args),
    }
}
