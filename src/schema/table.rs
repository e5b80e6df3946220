//! Canonical table identifiers.
//!
//! `TableId` ordinals are the canonical ids. They are assigned once and never
//! renumbered; retired tables keep their slot so every later id stays put.
//! Wire ordinals are version-local and come from [`super::translator`].

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! tables {
    ($($variant:ident = $ordinal:literal => $name:literal),+ $(,)?) => {
        /// Stable, version-independent table identifier.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[repr(u16)]
        pub enum TableId {
            $($variant = $ordinal,)+
        }

        impl TableId {
            /// Every table in canonical order.
            pub const ALL: &'static [TableId] = &[$(TableId::$variant,)+];

            /// Look up a table by canonical ordinal.
            pub fn from_ordinal(ordinal: u16) -> Option<Self> {
                match ordinal {
                    $($ordinal => Some(TableId::$variant),)+
                    _ => None,
                }
            }

            /// Table name as stored in the schema catalog.
            pub fn name(self) -> &'static str {
                match self {
                    $(TableId::$variant => $name,)+
                }
            }

            /// Look up a table by schema name.
            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(TableId::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

tables! {
    ProtocolVersions = 0 => "protocol_versions",
    SchemaTables = 1 => "schema_tables",
    SchemaColumns = 2 => "schema_columns",
    SchemaTypes = 3 => "schema_types",
    Accounts = 4 => "accounts",
    AccountHosts = 5 => "account_hosts",
    Administrators = 6 => "administrators",
    AdministratorPermissions = 7 => "administrator_permissions",
    Packages = 8 => "packages",
    PackageDefinitions = 9 => "package_definitions",
    BillingTransactions = 10 => "billing_transactions",
    MonthlyCharges = 11 => "monthly_charges",
    Hosts = 12 => "hosts",
    IpAddresses = 13 => "ip_addresses",
    NetBinds = 14 => "net_binds",
    FirewallZones = 15 => "firewall_zones",
    LinuxUsers = 16 => "linux_users",
    LinuxGroups = 17 => "linux_groups",
    LinuxServerAccounts = 18 => "linux_server_accounts",
    LinuxServerGroups = 19 => "linux_server_groups",
    MysqlServers = 20 => "mysql_servers",
    MysqlDatabases = 21 => "mysql_databases",
    MysqlUsers = 22 => "mysql_users",
    MysqlDbUsers = 23 => "mysql_db_users",
    PostgresServers = 24 => "postgres_servers",
    PostgresDatabases = 25 => "postgres_databases",
    PostgresUsers = 26 => "postgres_users",
    DnsZones = 27 => "dns_zones",
    DnsRecords = 28 => "dns_records",
    HttpdSites = 29 => "httpd_sites",
    HttpdServers = 30 => "httpd_servers",
    EmailDomains = 31 => "email_domains",
    EmailAddresses = 32 => "email_addresses",
    BackupPartitions = 33 => "backup_partitions",
    LegacyBackupData = 34 => "legacy_backup_data",
    FileReplications = 35 => "file_replications",
    Tickets = 36 => "tickets",
    TicketActions = 37 => "ticket_actions",
}

impl TableId {
    /// Canonical ordinal.
    pub fn ordinal(self) -> u16 {
        self as u16
    }

    /// Tables every session may see regardless of account or host scope.
    ///
    /// These describe the protocol itself; a client needs them to decode
    /// anything else.
    pub fn is_global(self) -> bool {
        matches!(
            self,
            TableId::ProtocolVersions
                | TableId::SchemaTables
                | TableId::SchemaColumns
                | TableId::SchemaTypes
        )
    }

    /// Tables whose change alters table-definition metadata.
    pub fn alters_schema(self) -> bool {
        matches!(
            self,
            TableId::ProtocolVersions | TableId::SchemaTables | TableId::SchemaColumns
        )
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Validity window of one table in protocol-version terms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDefinition {
    /// The table.
    pub table: TableId,
    /// First protocol version that carries the table.
    pub since_version: String,
    /// Last protocol version that carries the table, if retired.
    pub last_version: Option<String>,
}

impl TableDefinition {
    /// Create a definition for a table that is still current.
    pub fn new(table: TableId, since_version: impl Into<String>) -> Self {
        Self {
            table,
            since_version: since_version.into(),
            last_version: None,
        }
    }

    /// Mark the table retired after `last_version`.
    pub fn retired_after(mut self, last_version: impl Into<String>) -> Self {
        self.last_version = Some(last_version.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_are_dense_and_stable() {
        for (index, table) in TableId::ALL.iter().enumerate() {
            assert_eq!(table.ordinal() as usize, index);
            assert_eq!(TableId::from_ordinal(table.ordinal()), Some(*table));
        }
        assert_eq!(TableId::from_ordinal(TableId::ALL.len() as u16), None);
        assert_eq!(TableId::Hosts.ordinal(), 12);
    }

    #[test]
    fn names_round_trip() {
        for table in TableId::ALL {
            assert_eq!(TableId::from_name(table.name()), Some(*table));
        }
        assert_eq!(TableId::from_name("no_such_table"), None);
    }

    #[test]
    fn global_tables() {
        assert!(TableId::SchemaTables.is_global());
        assert!(!TableId::Accounts.is_global());
        assert!(TableId::ProtocolVersions.alters_schema());
        assert!(!TableId::SchemaTypes.alters_schema());
    }
}
