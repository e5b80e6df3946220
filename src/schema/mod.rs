//! Table identity and protocol version metadata.
//!
//! - [`table`] - Canonical [`TableId`] enumeration and validity windows
//! - [`version`] - Protocol version catalog and negotiation
//! - [`translator`] - Version-local ordinal translation with per-version caches

pub mod table;
pub mod translator;
pub mod version;

pub use table::{TableDefinition, TableId};
pub use translator::{TableTranslator, VersionTableMap};
pub use version::{ProtocolVersion, VersionCatalog};

/// Source of table-definition metadata.
///
/// In production this reads the schema tables; the translator only ever
/// calls it while rebuilding a cache.
pub trait SchemaSource: Send + Sync {
    /// Every protocol version the server knows, in any order.
    fn protocol_versions(&self) -> Vec<ProtocolVersion>;

    /// Validity window of every table.
    fn table_definitions(&self) -> Vec<TableDefinition>;
}

/// Schema compiled into the binary.
#[derive(Debug, Clone, Default)]
pub struct BuiltinSchema;

impl BuiltinSchema {
    /// Create the built-in schema.
    pub fn new() -> Self {
        Self
    }
}

impl SchemaSource for BuiltinSchema {
    fn protocol_versions(&self) -> Vec<ProtocolVersion> {
        vec![
            ProtocolVersion::new("1.0", 1, false),
            ProtocolVersion::new("1.30", 2, true),
            ProtocolVersion::new("1.60", 3, true),
            ProtocolVersion::new("1.80", 4, true),
            ProtocolVersion::new("1.81.0", 5, true),
            ProtocolVersion::new("1.83.0", 6, true),
        ]
    }

    fn table_definitions(&self) -> Vec<TableDefinition> {
        use TableId::*;

        TableId::ALL
            .iter()
            .map(|&table| match table {
                SchemaTypes | IpAddresses | NetBinds | LinuxServerAccounts
                | LinuxServerGroups => TableDefinition::new(table, "1.30"),
                FirewallZones | PostgresServers | PostgresDatabases | PostgresUsers => {
                    TableDefinition::new(table, "1.60")
                }
                LegacyBackupData => TableDefinition::new(table, "1.0").retired_after("1.60"),
                FileReplications => TableDefinition::new(table, "1.80"),
                AdministratorPermissions | Tickets | TicketActions => {
                    TableDefinition::new(table, "1.81.0")
                }
                _ => TableDefinition::new(table, "1.0"),
            })
            .collect()
    }
}
