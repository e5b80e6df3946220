//! Change-set delivery.
//!
//! [`FanOut::invalidate_tables`] runs on the committing task once per
//! committed unit of work. For every live session it selects the entries the
//! session may see, translates them into the session's version-local
//! ordinals and enqueues them as one batch. Daemon sessions bound to a host
//! named by a sync-required entry also get a sync obligation, whose id rides
//! along in the batch for the daemon to acknowledge.
//!
//! Change-sets are delivered one at a time, so every session observes
//! batches in commit order. Enqueueing never blocks; a failed enqueue is
//! logged against that session only.

use super::barrier::{SyncBarrier, SyncObligation};
use super::change_set::{InvalidateEntry, InvalidateList, Scope};
use super::CacheListener;
use crate::access::AccessControl;
use crate::core::ids::HostId;
use crate::schema::{TableId, TableTranslator};
use crate::session::{InvalidateBatch, Session, SessionRegistry};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Result of delivering one change-set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOutReport {
    /// Sessions that received a batch.
    pub sessions_notified: usize,
    /// Sessions whose enqueue failed.
    pub delivery_failures: usize,
    /// Obligations registered for this change-set.
    pub obligations: Vec<SyncObligation>,
    /// Concrete hosts named by sync-required entries.
    pub sync_hosts: BTreeSet<HostId>,
}

/// Fan-out counters.
#[derive(Debug, Default)]
pub struct FanOutStats {
    pub change_sets: AtomicU64,
    pub batches_delivered: AtomicU64,
    pub delivery_failures: AtomicU64,
}

/// Delivers committed change-sets to sessions and local caches.
pub struct FanOut {
    registry: Arc<SessionRegistry>,
    translator: Arc<TableTranslator>,
    access: Arc<dyn AccessControl>,
    barrier: Arc<SyncBarrier>,
    listeners: RwLock<Vec<Arc<dyn CacheListener>>>,
    /// Held for a whole delivery so batches keep commit order.
    order: Mutex<()>,
    stats: FanOutStats,
}

impl FanOut {
    pub fn new(
        registry: Arc<SessionRegistry>,
        translator: Arc<TableTranslator>,
        access: Arc<dyn AccessControl>,
        barrier: Arc<SyncBarrier>,
    ) -> Self {
        Self {
            registry,
            translator,
            access,
            barrier,
            listeners: RwLock::new(Vec::new()),
            order: Mutex::new(()),
            stats: FanOutStats::default(),
        }
    }

    /// Register a local cache to be cleared by matching change-sets.
    pub fn add_listener(&self, listener: Arc<dyn CacheListener>) {
        self.listeners.write().push(listener);
    }

    pub fn stats(&self) -> &FanOutStats {
        &self.stats
    }

    /// Deliver a committed change-set.
    pub fn invalidate_tables(&self, list: InvalidateList) -> FanOutReport {
        let mut report = FanOutReport::default();
        if list.is_empty() {
            return report;
        }

        let _order = self.order.lock();
        self.stats.change_sets.fetch_add(1, Ordering::Relaxed);
        let tables = list.tables();
        tracing::debug!(tables = ?tables, "delivering change-set");

        report.sync_hosts = self.sync_hosts(&list);

        for session in self.registry.snapshot() {
            self.deliver(&session, &list, &mut report);
        }

        for listener in self.listeners.read().iter() {
            listener.tables_invalidated(&tables);
        }

        self.stats
            .batches_delivered
            .fetch_add(report.sessions_notified as u64, Ordering::Relaxed);
        self.stats
            .delivery_failures
            .fetch_add(report.delivery_failures as u64, Ordering::Relaxed);
        report
    }

    fn deliver(&self, session: &Arc<Session>, list: &InvalidateList, report: &mut FanOutReport) {
        let visible: Vec<(TableId, &InvalidateEntry)> = list
            .entries()
            .filter(|(table, entry)| self.is_visible(session, *table, entry))
            .collect();
        if visible.is_empty() {
            return;
        }

        let map = self.translator.map_for(session.version());
        let mut ordinals: Vec<i32> = visible
            .iter()
            .filter_map(|(table, _)| map.to_client_ordinal(*table))
            .collect();
        if ordinals.is_empty() {
            return;
        }
        ordinals.sort_unstable();
        ordinals.dedup();

        let obligation = session.daemon_host().and_then(|host| {
            visible
                .iter()
                .any(|(_, entry)| entry.sync_required && entry.hosts.contains(&host))
                .then(|| self.barrier.register(host, session.id(), session.liveness()))
        });

        let batch = InvalidateBatch {
            tables: ordinals,
            sync_id: obligation.as_ref().map(|ob| ob.sync_id),
        };
        match session.enqueue(batch) {
            Ok(()) => {
                report.sessions_notified += 1;
                report.obligations.extend(obligation);
            }
            Err(err) => {
                report.delivery_failures += 1;
                tracing::warn!(session = %session.id(), error = %err, "invalidation delivery failed");
                if let Some(ob) = obligation {
                    self.barrier.release_session(ob.host, ob.session);
                }
            }
        }
    }

    fn is_visible(&self, session: &Session, table: TableId, entry: &InvalidateEntry) -> bool {
        if table.is_global() {
            return true;
        }
        if let Some(host) = session.daemon_host() {
            return entry.hosts.contains(&host);
        }

        let identity = session.effective_identity();
        let accounts = match &entry.accounts {
            Scope::All => true,
            Scope::Only(ids) => ids
                .iter()
                .any(|account| self.access.can_access_account(identity, account)),
        };
        accounts
            || match &entry.hosts {
                Scope::All => true,
                Scope::Only(ids) => ids
                    .iter()
                    .any(|host| self.access.can_access_host(identity, *host)),
            }
    }

    fn sync_hosts(&self, list: &InvalidateList) -> BTreeSet<HostId> {
        match list.sync_hosts() {
            None => BTreeSet::new(),
            Some(Scope::All) => self.registry.daemon_hosts().into_iter().collect(),
            Some(Scope::Only(hosts)) => hosts,
        }
    }
}
