//! Version-local table ordinal translation.
//!
//! A client speaking protocol version V numbers tables by their position in
//! the list of tables valid at V, ordered by canonical id. Both directions
//! are memoized per version and dropped whenever a change-set touching the
//! schema tables is delivered locally.
//!
//! Lookups never fail: an ordinal or table the version does not know resolves
//! to `None`, so version skew shows up as missing tables rather than errors.

use super::{ProtocolVersion, SchemaSource, TableId, VersionCatalog};
use crate::core::error::{HostplaneError, HostplaneResult};
use crate::invalidate::CacheListener;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Table ordinals for one protocol version.
#[derive(Debug, Clone, Default)]
pub struct VersionTableMap {
    version: String,
    tables: Vec<TableId>,
    ordinals: HashMap<TableId, i32>,
}

impl VersionTableMap {
    fn new(version: impl Into<String>, mut tables: Vec<TableId>) -> Self {
        tables.sort();
        tables.dedup();
        let ordinals = tables
            .iter()
            .enumerate()
            .map(|(position, table)| (*table, position as i32))
            .collect();
        Self {
            version: version.into(),
            tables,
            ordinals,
        }
    }

    /// Version this map belongs to.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Canonical table for a version-local ordinal.
    pub fn to_canonical(&self, ordinal: i32) -> Option<TableId> {
        usize::try_from(ordinal)
            .ok()
            .and_then(|index| self.tables.get(index).copied())
    }

    /// Version-local ordinal for a canonical table.
    pub fn to_client_ordinal(&self, table: TableId) -> Option<i32> {
        self.ordinals.get(&table).copied()
    }

    /// Tables valid in this version, in ordinal order.
    pub fn tables(&self) -> &[TableId] {
        &self.tables
    }

    /// Number of tables valid in this version.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Check whether the version carries no tables.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Memoizing translator between canonical and version-local table ids.
pub struct TableTranslator {
    schema: Arc<dyn SchemaSource>,

    /// Negotiable versions; `None` means whatever the catalog marks supported.
    allowed_versions: Option<Vec<String>>,

    catalog: RwLock<Option<Arc<VersionCatalog>>>,

    maps: RwLock<HashMap<String, Arc<VersionTableMap>>>,

    /// Bumped by every invalidation so a rebuild racing with it is discarded.
    generation: AtomicU64,

    rebuilds: AtomicU64,
}

impl TableTranslator {
    /// Create a translator over a schema source.
    pub fn new(schema: Arc<dyn SchemaSource>) -> Self {
        Self {
            schema,
            allowed_versions: None,
            catalog: RwLock::new(None),
            maps: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            rebuilds: AtomicU64::new(0),
        }
    }

    /// Restrict negotiation to a subset of the catalog.
    pub fn with_allowed_versions(mut self, allowed: Vec<String>) -> Self {
        self.allowed_versions = Some(allowed);
        self
    }

    /// Current version catalog.
    pub fn catalog(&self) -> Arc<VersionCatalog> {
        if let Some(catalog) = self.catalog.read().as_ref() {
            return Arc::clone(catalog);
        }

        let generation = self.generation.load(Ordering::Acquire);
        let mut catalog = VersionCatalog::new(self.schema.protocol_versions());
        if let Some(allowed) = &self.allowed_versions {
            catalog.restrict_to(allowed);
        }
        let catalog = Arc::new(catalog);

        let mut slot = self.catalog.write();
        if self.generation.load(Ordering::Acquire) == generation {
            *slot = Some(Arc::clone(&catalog));
        }
        catalog
    }

    /// Resolve a handshake version string.
    pub fn negotiate(&self, requested: &str) -> HostplaneResult<ProtocolVersion> {
        let catalog = self.catalog();
        catalog
            .resolve(requested)
            .cloned()
            .ok_or_else(|| HostplaneError::UnsupportedVersion {
                requested: requested.to_string(),
                supported: catalog.supported_names(),
            })
    }

    /// Table map for a version, building it on first use.
    pub fn map_for(&self, version: &str) -> Arc<VersionTableMap> {
        if let Some(map) = self.maps.read().get(version) {
            return Arc::clone(map);
        }

        let generation = self.generation.load(Ordering::Acquire);
        let map = Arc::new(self.build(version));
        self.rebuilds.fetch_add(1, Ordering::Relaxed);

        let mut maps = self.maps.write();
        if self.generation.load(Ordering::Acquire) != generation {
            return map;
        }
        Arc::clone(
            maps.entry(version.to_string())
                .or_insert_with(|| Arc::clone(&map)),
        )
    }

    fn build(&self, version: &str) -> VersionTableMap {
        let catalog = self.catalog();
        let Some(target) = catalog.get(version) else {
            tracing::debug!(version, "table map requested for unknown protocol version");
            return VersionTableMap::new(version, Vec::new());
        };

        let tables = self
            .schema
            .table_definitions()
            .into_iter()
            .filter(|def| {
                let Some(since) = catalog.get(&def.since_version) else {
                    tracing::warn!(
                        table = %def.table,
                        since = %def.since_version,
                        "table definition references unknown protocol version"
                    );
                    return false;
                };
                let until = match &def.last_version {
                    Some(last) => match catalog.get(last) {
                        Some(last) => last.release,
                        None => return false,
                    },
                    None => u32::MAX,
                };
                since.release <= target.release && target.release <= until
            })
            .map(|def| def.table)
            .collect();

        VersionTableMap::new(version, tables)
    }

    /// Canonical table for a client ordinal in `version`.
    pub fn to_canonical(&self, version: &str, ordinal: i32) -> Option<TableId> {
        self.map_for(version).to_canonical(ordinal)
    }

    /// Client ordinal for a canonical table in `version`.
    pub fn to_client_ordinal(&self, version: &str, table: TableId) -> Option<i32> {
        self.map_for(version).to_client_ordinal(table)
    }

    /// Drop every cached catalog and map.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.catalog.write().take();
        self.maps.write().clear();
        tracing::debug!("table translator caches cleared");
    }

    /// Number of per-version maps built so far.
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds.load(Ordering::Relaxed)
    }
}

impl CacheListener for TableTranslator {
    fn tables_invalidated(&self, tables: &[TableId]) {
        if tables.iter().any(|table| table.alters_schema()) {
            self.invalidate();
        }
    }
}
