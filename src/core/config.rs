//! Configuration parsing and validation.
//!
//! Hostplane configuration is loaded from TOML files with CLI overrides.
//! The `[[hosts]]` and `[[identities]]` tables feed the built-in static
//! access control; deployments backed by a real directory leave them empty.

use crate::schema::{BuiltinSchema, SchemaSource};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Top-level hostplane configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Client listener configuration.
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Protocol and barrier configuration.
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Logging configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Host directory entries.
    #[serde(default)]
    pub hosts: Vec<HostEntry>,

    /// Administrator and daemon identities.
    #[serde(default)]
    pub identities: Vec<IdentityConfig>,
}

/// Client listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:4582").
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Maximum concurrent connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Set TCP_NODELAY on accepted sockets.
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,

    /// Largest request the codec will buffer.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Time a peer gets to complete the handshake.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_connections: default_max_connections(),
            nodelay: default_nodelay(),
            max_frame_bytes: default_max_frame_bytes(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

impl ListenerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Protocol and barrier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Upper bound on a synchronous invalidation wait.
    #[serde(default = "default_barrier_timeout_ms")]
    pub barrier_timeout_ms: u64,

    /// Versions offered to clients; unset offers every supported version.
    #[serde(default)]
    pub supported_versions: Option<Vec<String>>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            barrier_timeout_ms: default_barrier_timeout_ms(),
            supported_versions: None,
        }
    }
}

impl ProtocolConfig {
    pub fn barrier_timeout(&self) -> Duration {
        Duration::from_millis(self.barrier_timeout_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// One host directory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostEntry {
    pub id: u32,
    pub hostname: String,
}

/// One identity and its grants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Login name.
    pub name: String,

    /// Argon2 PHC string of the credential.
    pub password_hash: String,

    /// May bind daemons and wait on barriers.
    #[serde(default)]
    pub privileged: bool,

    /// May connect with a different effective identity.
    #[serde(default)]
    pub can_switch_users: bool,

    /// Visible accounts; `"*"` means every account.
    #[serde(default)]
    pub accounts: Vec<String>,

    /// Visible host ids.
    #[serde(default)]
    pub hosts: Vec<u32>,

    /// Every host is visible.
    #[serde(default)]
    pub all_hosts: bool,
}

// Default value functions

fn default_bind() -> String {
    "0.0.0.0:4582".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_nodelay() -> bool {
    true
}

fn default_max_frame_bytes() -> usize {
    1024 * 1024
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_barrier_timeout_ms() -> u64 {
    60_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(ref bind) = overrides.bind {
            self.listener.bind = bind.clone();
        }
        if let Some(timeout) = overrides.barrier_timeout_ms {
            self.protocol.barrier_timeout_ms = timeout;
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_listener()?;
        self.validate_protocol()?;
        self.validate_telemetry()?;
        self.validate_directory()?;
        Ok(())
    }

    fn validate_listener(&self) -> Result<()> {
        self.listener
            .bind
            .parse::<SocketAddr>()
            .with_context(|| format!("listener.bind is not a socket address: {}", self.listener.bind))?;

        if self.listener.max_connections == 0 {
            anyhow::bail!("listener.max_connections must be > 0");
        }
        if self.listener.max_frame_bytes == 0 {
            anyhow::bail!("listener.max_frame_bytes must be > 0");
        }
        if self.listener.handshake_timeout_ms == 0 {
            anyhow::bail!("listener.handshake_timeout_ms must be > 0");
        }
        Ok(())
    }

    fn validate_protocol(&self) -> Result<()> {
        if self.protocol.barrier_timeout_ms == 0 {
            anyhow::bail!("protocol.barrier_timeout_ms must be > 0");
        }

        if let Some(ref versions) = self.protocol.supported_versions {
            if versions.is_empty() {
                anyhow::bail!("protocol.supported_versions must not be empty when set");
            }
            let known: Vec<String> = BuiltinSchema::new()
                .protocol_versions()
                .into_iter()
                .filter(|version| version.supported)
                .map(|version| version.name)
                .collect();
            for version in versions {
                if !known.contains(version) {
                    anyhow::bail!(
                        "protocol.supported_versions contains unknown version {}, known: {:?}",
                        version,
                        known
                    );
                }
            }
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }

    fn validate_directory(&self) -> Result<()> {
        let mut ids = HashSet::new();
        let mut hostnames = HashSet::new();
        for host in &self.hosts {
            if !ids.insert(host.id) {
                anyhow::bail!("hosts: duplicate host id {}", host.id);
            }
            if host.hostname.trim().is_empty() {
                anyhow::bail!("hosts: host {} has an empty hostname", host.id);
            }
            if !hostnames.insert(host.hostname.as_str()) {
                anyhow::bail!("hosts: duplicate hostname {}", host.hostname);
            }
        }

        let mut names = HashSet::new();
        for identity in &self.identities {
            if identity.name.trim().is_empty() {
                anyhow::bail!("identities: empty identity name");
            }
            if !names.insert(identity.name.as_str()) {
                anyhow::bail!("identities: duplicate identity {}", identity.name);
            }
            for host in &identity.hosts {
                if !ids.contains(host) {
                    anyhow::bail!(
                        "identities.{}: references unknown host id {}",
                        identity.name,
                        host
                    );
                }
            }
        }
        Ok(())
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Override listener bind address.
    pub bind: Option<String>,
    /// Override barrier timeout.
    pub barrier_timeout_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.listener.bind, "0.0.0.0:4582");
        assert_eq!(config.protocol.barrier_timeout(), Duration::from_secs(60));
        assert_eq!(config.telemetry.log_level, "info");
        assert!(config.identities.is_empty());
    }

    #[test]
    fn overrides_apply() {
        let mut config = Config::default();
        config.apply_overrides(&ConfigOverrides {
            log_level: Some("debug".to_string()),
            bind: Some("127.0.0.1:0".to_string()),
            barrier_timeout_ms: Some(250),
        });
        assert_eq!(config.telemetry.log_level, "debug");
        assert_eq!(config.listener.bind, "127.0.0.1:0");
        assert_eq!(config.protocol.barrier_timeout_ms, 250);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_unknown_version() {
        let err = Config::from_toml("[protocol]\nsupported_versions = [\"1.83.0\", \"7.0\"]\n")
            .unwrap_err();
        assert!(err.to_string().contains("7.0"));
    }

    #[test]
    fn rejects_identity_with_unknown_host() {
        let toml = r#"
[[hosts]]
id = 1
hostname = "web1.example.net"

[[identities]]
name = "daemon"
password_hash = "x"
hosts = [2]
"#;
        assert!(Config::from_toml(toml).is_err());
    }
}
