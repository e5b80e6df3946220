//! Accepted connections and their lookup tables.
//!
//! A [`Session`] exists from a successful handshake until its connection task
//! ends. Fan-out only ever touches a session through its outbound queue, so
//! a slow consumer never blocks a committing writer.

mod registry;

pub use registry::{RegistryStats, SessionRegistry};

use crate::core::error::{HostplaneError, HostplaneResult};
use crate::core::ids::{ConnectorId, HostId, Identity, SessionId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Shared closed flag of one session.
///
/// Sync obligations hold a clone so the barrier can observe a closed owner
/// without reaching back into the registry.
#[derive(Debug, Clone, Default)]
pub struct SessionLiveness(Arc<AtomicBool>);

impl SessionLiveness {
    /// Create an open handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark closed. Returns true on the first call.
    pub fn close(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    /// Check whether the session has closed.
    pub fn is_closed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// One out-of-band invalidation message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidateBatch {
    /// Version-local table ordinals, ascending.
    pub tables: Vec<i32>,
    /// Sync id the daemon must acknowledge after applying the batch.
    pub sync_id: Option<i64>,
}

/// Identity and binding fixed by the handshake.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub connector_id: ConnectorId,
    pub version: String,
    pub authenticated: Identity,
    pub effective: Identity,
    pub daemon_host: Option<HostId>,
}

/// A live, authenticated connection.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    info: SessionInfo,
    outbound: mpsc::UnboundedSender<InvalidateBatch>,
    liveness: SessionLiveness,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        info: SessionInfo,
    ) -> (Self, mpsc::UnboundedReceiver<InvalidateBatch>) {
        let (outbound, inbound) = mpsc::unbounded_channel();
        let session = Self {
            id,
            info,
            outbound,
            liveness: SessionLiveness::new(),
        };
        (session, inbound)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn connector_id(&self) -> &ConnectorId {
        &self.info.connector_id
    }

    /// Negotiated protocol version name.
    pub fn version(&self) -> &str {
        &self.info.version
    }

    pub fn authenticated_identity(&self) -> &Identity {
        &self.info.authenticated
    }

    /// Identity used for access decisions.
    pub fn effective_identity(&self) -> &Identity {
        &self.info.effective
    }

    /// Host this daemon session is bound to.
    pub fn daemon_host(&self) -> Option<HostId> {
        self.info.daemon_host
    }

    pub fn is_daemon(&self) -> bool {
        self.info.daemon_host.is_some()
    }

    pub fn liveness(&self) -> SessionLiveness {
        self.liveness.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.liveness.is_closed()
    }

    /// Mark the session closed. Returns true on the first call.
    pub fn close(&self) -> bool {
        self.liveness.close()
    }

    /// Queue a batch for the connection task.
    ///
    /// The whole batch is one queue item, so two change-sets never
    /// interleave on one session.
    pub fn enqueue(&self, batch: InvalidateBatch) -> HostplaneResult<()> {
        if self.is_closed() {
            return Err(HostplaneError::ConnectionClosed);
        }
        self.outbound
            .send(batch)
            .map_err(|_| HostplaneError::ConnectionClosed)
    }
}
