//! Command-line interface.
//!
//! Unified CLI for hostplane operations.

pub mod commands;

use clap::{Parser, Subcommand};

/// Hostplane - master control plane with synchronized cache invalidation.
#[derive(Parser, Debug)]
#[command(name = "hostplane")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the hostplane master.
    Start(commands::StartArgs),
    /// Configuration operations.
    Config(commands::ConfigArgs),
    /// Print the table numbering of a protocol version.
    Tables(commands::TablesArgs),
    /// Hash a password for the identities table.
    HashPassword(commands::HashPasswordArgs),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_start_overrides() {
        let cli = Cli::try_parse_from([
            "hostplane",
            "--config",
            "hp.toml",
            "start",
            "--bind",
            "127.0.0.1:9000",
        ])
        .unwrap();
        assert_eq!(cli.config.as_deref(), Some("hp.toml"));
        match cli.command {
            Commands::Start(args) => assert_eq!(args.bind.as_deref(), Some("127.0.0.1:9000")),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn parses_tables_version() {
        let cli = Cli::try_parse_from(["hostplane", "tables", "--version", "1.83.0"]).unwrap();
        match cli.command {
            Commands::Tables(args) => assert_eq!(args.protocol_version, "1.83.0"),
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
