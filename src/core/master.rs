//! Shared server state.
//!
//! [`Master`] owns the process-wide pieces every connection task needs: the
//! table translator, the session registry, the sync barrier, the fan-out
//! engine and the external collaborators. Write paths reach the invalidation
//! core through [`Master::begin_work`], [`Master::invalidate_tables`] and
//! [`Master::wait_for_invalidates`].

use crate::access::{AccessControl, HostDirectory, HostLookupCache, StaticAccessControl};
use crate::core::config::Config;
use crate::core::error::HostplaneResult;
use crate::core::ids::HostId;
use crate::invalidate::{
    BarrierOutcome, Database, FanOut, FanOutReport, InvalidateList, NoopDatabase, SyncBarrier,
    UnitOfWork,
};
use crate::protocol::{RequestHandler, UnsupportedHandler};
use crate::schema::{BuiltinSchema, SchemaSource, TableTranslator};
use crate::session::{InvalidateBatch, Session, SessionInfo, SessionRegistry};
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Point-in-time counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MasterStats {
    pub sessions_open: usize,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub change_sets: u64,
    pub batches_delivered: u64,
    pub delivery_failures: u64,
    pub obligations_registered: u64,
    pub obligations_acknowledged: u64,
    pub obligations_released: u64,
    pub barrier_timeouts: u64,
}

/// Builder for [`Master`].
pub struct MasterBuilder {
    schema: Arc<dyn SchemaSource>,
    access: Arc<dyn AccessControl>,
    directory: Arc<dyn HostDirectory>,
    database: Arc<dyn Database>,
    handler: Arc<dyn RequestHandler>,
    supported_versions: Option<Vec<String>>,
    barrier_timeout: Duration,
    handshake_timeout: Duration,
    max_frame_bytes: usize,
}

impl MasterBuilder {
    pub fn schema(mut self, schema: Arc<dyn SchemaSource>) -> Self {
        self.schema = schema;
        self
    }

    pub fn database(mut self, database: Arc<dyn Database>) -> Self {
        self.database = database;
        self
    }

    pub fn handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn supported_versions(mut self, versions: Option<Vec<String>>) -> Self {
        self.supported_versions = versions;
        self
    }

    pub fn barrier_timeout(mut self, timeout: Duration) -> Self {
        self.barrier_timeout = timeout;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    pub fn build(self) -> Master {
        let mut translator = TableTranslator::new(self.schema);
        if let Some(versions) = self.supported_versions {
            translator = translator.with_allowed_versions(versions);
        }
        let translator = Arc::new(translator);
        let registry = Arc::new(SessionRegistry::new());
        let barrier = Arc::new(SyncBarrier::new(self.barrier_timeout));
        let hosts = Arc::new(HostLookupCache::new(self.directory));

        let fanout = Arc::new(FanOut::new(
            Arc::clone(&registry),
            Arc::clone(&translator),
            Arc::clone(&self.access),
            Arc::clone(&barrier),
        ));
        fanout.add_listener(translator.clone());
        fanout.add_listener(hosts.clone());

        Master {
            translator,
            registry,
            barrier,
            fanout,
            access: self.access,
            hosts,
            database: self.database,
            handler: self.handler,
            handshake_timeout: self.handshake_timeout,
            max_frame_bytes: self.max_frame_bytes,
        }
    }
}

/// Process-wide server state.
pub struct Master {
    translator: Arc<TableTranslator>,
    registry: Arc<SessionRegistry>,
    barrier: Arc<SyncBarrier>,
    fanout: Arc<FanOut>,
    access: Arc<dyn AccessControl>,
    hosts: Arc<HostLookupCache>,
    database: Arc<dyn Database>,
    handler: Arc<dyn RequestHandler>,
    handshake_timeout: Duration,
    max_frame_bytes: usize,
}

impl Master {
    /// Start building with the given policy and host directory.
    pub fn builder(
        access: Arc<dyn AccessControl>,
        directory: Arc<dyn HostDirectory>,
    ) -> MasterBuilder {
        MasterBuilder {
            schema: Arc::new(BuiltinSchema::new()),
            access,
            directory,
            database: Arc::new(NoopDatabase),
            handler: Arc::new(UnsupportedHandler),
            supported_versions: None,
            barrier_timeout: crate::invalidate::barrier::DEFAULT_BARRIER_TIMEOUT,
            handshake_timeout: crate::protocol::handshake::DEFAULT_HANDSHAKE_TIMEOUT,
            max_frame_bytes: 1024 * 1024,
        }
    }

    /// Stand-alone server backed by the configured static access control.
    pub fn from_config(config: &Config) -> Self {
        let acl = Arc::new(StaticAccessControl::from_config(config));
        Self::builder(acl.clone(), acl)
            .supported_versions(config.protocol.supported_versions.clone())
            .barrier_timeout(config.protocol.barrier_timeout())
            .handshake_timeout(config.listener.handshake_timeout())
            .max_frame_bytes(config.listener.max_frame_bytes)
            .build()
    }

    pub fn translator(&self) -> &TableTranslator {
        &self.translator
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn barrier(&self) -> &SyncBarrier {
        &self.barrier
    }

    pub fn access(&self) -> &Arc<dyn AccessControl> {
        &self.access
    }

    pub fn hosts(&self) -> &HostLookupCache {
        &self.hosts
    }

    pub fn handler(&self) -> &dyn RequestHandler {
        self.handler.as_ref()
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Deadline for a new connection to finish its handshake.
    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Begin a unit of work against the database.
    pub fn begin_work(&self) -> HostplaneResult<UnitOfWork> {
        UnitOfWork::begin(self.database.as_ref(), Arc::clone(&self.fanout))
    }

    /// Deliver a committed change-set.
    pub fn invalidate_tables(&self, list: InvalidateList) -> FanOutReport {
        self.fanout.invalidate_tables(list)
    }

    /// Wait until daemons on `host` applied everything issued so far.
    pub async fn wait_for_invalidates(&self, host: HostId) -> BarrierOutcome {
        self.barrier.wait_for_invalidates(host).await
    }

    pub(crate) fn open_session(
        &self,
        info: SessionInfo,
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<InvalidateBatch>) {
        self.registry.register(info)
    }

    /// Remove a session and release whatever it still owed.
    pub(crate) fn close_session(&self, session: &Session) {
        self.registry.unregister(session.id());
        if let Some(host) = session.daemon_host() {
            self.barrier.release_session(host, session.id());
        }
    }

    pub fn stats(&self) -> MasterStats {
        let registry = self.registry.stats();
        let fanout = self.fanout.stats();
        let barrier = self.barrier.stats();
        MasterStats {
            sessions_open: self.registry.len(),
            sessions_opened: registry.opened.load(Ordering::Relaxed),
            sessions_closed: registry.closed.load(Ordering::Relaxed),
            change_sets: fanout.change_sets.load(Ordering::Relaxed),
            batches_delivered: fanout.batches_delivered.load(Ordering::Relaxed),
            delivery_failures: fanout.delivery_failures.load(Ordering::Relaxed),
            obligations_registered: barrier.registered.load(Ordering::Relaxed),
            obligations_acknowledged: barrier.acknowledged.load(Ordering::Relaxed),
            obligations_released: barrier.released.load(Ordering::Relaxed),
            barrier_timeouts: barrier.timeouts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::{ConnectorId, Identity};
    use crate::invalidate::Scope;
    use crate::schema::TableId;

    fn master() -> Master {
        let config = Config::from_toml(
            r#"
[protocol]
barrier_timeout_ms = 100

[[hosts]]
id = 10
hostname = "web1.example.net"
"#,
        )
        .unwrap();
        Master::from_config(&config)
    }

    fn daemon_info() -> SessionInfo {
        SessionInfo {
            connector_id: ConnectorId::generate(),
            version: "1.83.0".to_string(),
            authenticated: Identity::from("daemon"),
            effective: Identity::from("daemon"),
            daemon_host: Some(HostId(10)),
        }
    }

    #[tokio::test]
    async fn closing_a_session_satisfies_its_obligations() {
        let master = master();
        let (session, mut rx) = master.open_session(daemon_info());

        let mut list = InvalidateList::new();
        list.add_table(TableId::HttpdSites, Scope::All, Scope::only([10u32]), true);
        let report = master.invalidate_tables(list);
        assert_eq!(report.obligations.len(), 1);
        assert!(rx.recv().await.unwrap().sync_id.is_some());

        master.close_session(&session);
        assert_eq!(
            master.wait_for_invalidates(HostId(10)).await,
            BarrierOutcome::Satisfied { target: 1 }
        );

        let stats = master.stats();
        assert_eq!(stats.sessions_open, 0);
        assert_eq!(stats.sessions_opened, 1);
        assert_eq!(stats.sessions_closed, 1);
        assert_eq!(stats.obligations_registered, 1);
        assert_eq!(stats.obligations_released, 1);
    }

    #[tokio::test]
    async fn hosts_change_set_clears_hostname_cache() {
        let master = master();
        assert_eq!(master.hosts().resolve("web1.example.net"), Some(HostId(10)));
        assert_eq!(master.hosts().misses(), 1);

        let mut list = InvalidateList::new();
        list.add_table_all(TableId::Hosts);
        master.invalidate_tables(list);

        assert_eq!(master.hosts().resolve("web1.example.net"), Some(HostId(10)));
        assert_eq!(master.hosts().misses(), 2);
    }

    #[test]
    fn schema_change_set_rebuilds_translator() {
        let master = master();
        master.translator().map_for("1.83.0");

        let mut list = InvalidateList::new();
        list.add_table_all(TableId::SchemaTables);
        master.invalidate_tables(list);

        master.translator().map_for("1.83.0");
        assert_eq!(master.translator().rebuild_count(), 2);
    }
}
