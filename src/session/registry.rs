//! Live session lookups.

use super::{InvalidateBatch, Session, SessionInfo};
use crate::core::ids::{HostId, SessionId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct RegistryInner {
    sessions: BTreeMap<SessionId, Arc<Session>>,
    /// Daemon sessions by bound host.
    by_host: BTreeMap<HostId, BTreeSet<SessionId>>,
}

/// Registry counters.
#[derive(Debug, Default)]
pub struct RegistryStats {
    pub opened: AtomicU64,
    pub closed: AtomicU64,
}

/// Every session currently in `Serving`.
#[derive(Debug)]
pub struct SessionRegistry {
    next_id: AtomicU64,
    inner: RwLock<RegistryInner>,
    stats: RegistryStats,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            inner: RwLock::new(RegistryInner::default()),
            stats: RegistryStats::default(),
        }
    }

    /// Admit a session and return it with the receiving end of its queue.
    pub fn register(
        &self,
        info: SessionInfo,
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<InvalidateBatch>) {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (session, inbound) = Session::new(id, info);
        let session = Arc::new(session);

        {
            let mut inner = self.inner.write();
            if let Some(host) = session.daemon_host() {
                inner.by_host.entry(host).or_default().insert(id);
            }
            inner.sessions.insert(id, Arc::clone(&session));
        }
        self.stats.opened.fetch_add(1, Ordering::Relaxed);
        (session, inbound)
    }

    /// Remove a session from every lookup and mark it closed.
    pub fn unregister(&self, id: SessionId) -> Option<Arc<Session>> {
        let session = {
            let mut inner = self.inner.write();
            let session = inner.sessions.remove(&id)?;
            if let Some(host) = session.daemon_host() {
                if let Some(ids) = inner.by_host.get_mut(&host) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        inner.by_host.remove(&host);
                    }
                }
            }
            session
        };
        session.close();
        self.stats.closed.fetch_add(1, Ordering::Relaxed);
        Some(session)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.inner.read().sessions.get(&id).cloned()
    }

    /// Live sessions in id order.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.inner
            .read()
            .sessions
            .values()
            .filter(|session| !session.is_closed())
            .cloned()
            .collect()
    }

    /// Hosts with at least one bound daemon session.
    pub fn daemon_hosts(&self) -> Vec<HostId> {
        self.inner.read().by_host.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> &RegistryStats {
        &self.stats
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
