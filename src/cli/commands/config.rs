//! Config command implementation.

use crate::core::config::Config;
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate configuration file.
    Validate {
        /// Config file path.
        #[arg(short, long, default_value = "config/hostplane.toml")]
        config: PathBuf,
    },
    /// Print configuration with defaults.
    Show {
        /// Config file path.
        #[arg(short, long, default_value = "config/hostplane.toml")]
        config: PathBuf,
        /// Output format (toml, json).
        #[arg(long, default_value = "toml")]
        format: String,
    },
    /// Generate a configuration template.
    Generate {
        /// Output file path.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Run the config command.
pub fn run_config(args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommand::Validate { config } => validate_config(&config),
        ConfigCommand::Show { config, format } => show_config(&config, &format),
        ConfigCommand::Generate { output } => generate_config(output.as_deref()),
    }
}

fn validate_config(path: &Path) -> Result<()> {
    let config = Config::from_file(path)?;
    println!("✓ Config file is valid: {}", path.display());
    println!(
        "  listener {} ({} max connections)",
        config.listener.bind, config.listener.max_connections
    );
    println!(
        "  {} hosts, {} identities",
        config.hosts.len(),
        config.identities.len()
    );
    if config.identities.is_empty() {
        println!("  ⚠ Warning: no identities configured, every handshake will be rejected");
    }
    Ok(())
}

/// Render a configuration, defaults filled in.
pub fn render_config(config: &Config, format: &str) -> Result<String> {
    match format {
        "json" => serde_json::to_string_pretty(config).context("failed to render config as JSON"),
        "toml" => toml::to_string_pretty(config).context("failed to render config as TOML"),
        other => anyhow::bail!("unknown format {}, expected toml or json", other),
    }
}

fn show_config(path: &Path, format: &str) -> Result<()> {
    let config = Config::from_file(path)?;
    println!("{}", render_config(&config, format)?);
    Ok(())
}

fn generate_config(output: Option<&Path>) -> Result<()> {
    let template = config_template();
    match output {
        Some(path) => {
            std::fs::write(path, template)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Generated config template: {}", path.display());
        }
        None => println!("{}", template),
    }
    Ok(())
}

fn config_template() -> &'static str {
    r#"# Hostplane Configuration

[listener]
bind = "0.0.0.0:4582"
max_connections = 10000
nodelay = true
max_frame_bytes = 1048576
handshake_timeout_ms = 10000

[protocol]
barrier_timeout_ms = 60000
# supported_versions = ["1.81.0", "1.83.0"]

[telemetry]
log_level = "info"

[[hosts]]
id = 1
hostname = "web1.example.net"

# Generate password hashes with `hostplane hash-password`.
[[identities]]
name = "admin"
password_hash = "$argon2id$v=19$m=19456,t=2,p=1$replace-me$replace-me"
privileged = true
can_switch_users = true
accounts = ["*"]
all_hosts = true

[[identities]]
name = "daemon-web1"
password_hash = "$argon2id$v=19$m=19456,t=2,p=1$replace-me$replace-me"
privileged = true
hosts = [1]
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_parses() {
        let config = Config::from_toml(config_template()).unwrap();
        assert_eq!(config.hosts.len(), 1);
        assert_eq!(config.identities.len(), 2);
    }

    #[test]
    fn render_round_trips_through_toml() {
        let config = Config::from_toml(config_template()).unwrap();
        let rendered = render_config(&config, "toml").unwrap();
        let reparsed = Config::from_toml(&rendered).unwrap();
        assert_eq!(reparsed.listener.bind, config.listener.bind);
        assert_eq!(reparsed.identities.len(), 2);
    }

    #[test]
    fn render_rejects_unknown_format() {
        assert!(render_config(&Config::default(), "yaml").is_err());
    }
}
