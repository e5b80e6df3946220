//! Memoized hostname lookups.

use super::HostDirectory;
use crate::core::ids::HostId;
use crate::invalidate::CacheListener;
use crate::schema::TableId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Hostname cache dropped whenever a change-set touching `Hosts` is
/// delivered locally.
///
/// Only successful lookups are cached, so a host added after a failed
/// daemon handshake is found on the next attempt.
pub struct HostLookupCache {
    directory: Arc<dyn HostDirectory>,
    entries: RwLock<HashMap<String, HostId>>,
    /// Bumped by every clear; lookups started earlier do not cache.
    generation: AtomicU64,
    misses: AtomicU64,
}

impl HostLookupCache {
    pub fn new(directory: Arc<dyn HostDirectory>) -> Self {
        Self {
            directory,
            entries: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Host id for `hostname`.
    pub fn resolve(&self, hostname: &str) -> Option<HostId> {
        if let Some(host) = self.entries.read().get(hostname) {
            return Some(*host);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let generation = self.generation.load(Ordering::Acquire);
        let host = self.directory.resolve_hostname(hostname)?;

        let mut entries = self.entries.write();
        if self.generation.load(Ordering::Acquire) == generation {
            entries.insert(hostname.to_string(), host);
        }
        Some(host)
    }

    /// Directory lookups performed so far.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        entries.clear();
    }
}

impl CacheListener for HostLookupCache {
    fn tables_invalidated(&self, tables: &[TableId]) {
        if tables.contains(&TableId::Hosts) {
            self.clear();
            tracing::debug!("hostname cache cleared");
        }
    }
}
