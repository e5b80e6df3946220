//! TCP listener.
//!
//! Accepts client sockets and hands each to its own connection task. The
//! accept loop and every connection task watch the same shutdown channel.

use crate::core::config::ListenerConfig;
use crate::core::error::{HostplaneError, HostplaneResult};
use crate::core::master::Master;
use crate::protocol::serve_connection;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::sync::watch;

/// TCP listener configuration.
#[derive(Debug, Clone)]
pub struct TcpListenerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// TCP nodelay (disable Nagle's algorithm).
    pub nodelay: bool,
}

impl TcpListenerConfig {
    /// Build from the `[listener]` section.
    pub fn from_config(config: &ListenerConfig) -> HostplaneResult<Self> {
        let bind_addr = config.bind.parse().map_err(|_| {
            HostplaneError::internal(format!("invalid bind address: {}", config.bind))
        })?;
        Ok(Self {
            bind_addr,
            max_connections: config.max_connections,
            nodelay: config.nodelay,
        })
    }
}

/// TCP listener state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpListenerState {
    /// Not yet started.
    Created,
    /// Binding to address.
    Binding,
    /// Accepting connections.
    Listening,
    /// Shutting down.
    ShuttingDown,
    /// Stopped.
    Stopped,
}

/// Connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// TCP listener metrics.
#[derive(Debug, Default)]
pub struct TcpListenerMetrics {
    /// Total connections accepted.
    pub connections_total: AtomicU64,

    /// Currently active connections.
    pub connections_active: AtomicU64,

    /// Connections rejected (at capacity).
    pub connections_rejected: AtomicU64,

    /// Total bytes received.
    pub bytes_received: AtomicU64,

    /// Total bytes sent.
    pub bytes_sent: AtomicU64,
}

impl TcpListenerMetrics {
    /// Record a new connection.
    pub fn connection_accepted(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed.
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a rejected connection.
    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Get active connection count.
    pub fn active_connections(&self) -> u64 {
        self.connections_active.load(Ordering::Relaxed)
    }
}

/// TCP listener for accepting connections.
pub struct TcpListener {
    /// Configuration.
    config: TcpListenerConfig,

    /// Current state.
    state: RwLock<TcpListenerState>,

    /// Next connection ID.
    next_conn_id: AtomicU64,

    /// Shutdown flag.
    shutting_down: AtomicBool,

    /// Shutdown signal receiver.
    shutdown_rx: watch::Receiver<bool>,

    /// Metrics.
    metrics: Arc<TcpListenerMetrics>,
}

impl TcpListener {
    /// Create a new TCP listener.
    pub fn new(config: TcpListenerConfig, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            config,
            state: RwLock::new(TcpListenerState::Created),
            next_conn_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            shutdown_rx,
            metrics: Arc::new(TcpListenerMetrics::default()),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &TcpListenerConfig {
        &self.config
    }

    /// Get the current state.
    pub fn state(&self) -> TcpListenerState {
        *self.state.read()
    }

    /// Get metrics.
    pub fn metrics(&self) -> &Arc<TcpListenerMetrics> {
        &self.metrics
    }

    /// Check if at connection capacity.
    pub fn at_capacity(&self) -> bool {
        self.metrics.active_connections() >= self.config.max_connections as u64
    }

    fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_conn_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Bind and start listening.
    pub async fn bind(&self) -> HostplaneResult<TokioTcpListener> {
        *self.state.write() = TcpListenerState::Binding;

        let listener = TokioTcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| {
                HostplaneError::internal(format!(
                    "failed to bind to {}: {}",
                    self.config.bind_addr, e
                ))
            })?;

        *self.state.write() = TcpListenerState::Listening;
        Ok(listener)
    }

    /// Accept one connection, or `None` once shutdown is signalled.
    ///
    /// Sockets arriving while at capacity are closed immediately.
    pub async fn accept(
        &self,
        listener: &TokioTcpListener,
    ) -> HostplaneResult<Option<(ConnectionId, TcpStream, SocketAddr)>> {
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            if self.shutting_down.load(Ordering::Relaxed) || *shutdown_rx.borrow() {
                return Ok(None);
            }

            tokio::select! {
                result = listener.accept() => {
                    let (stream, addr) = result.map_err(|e| {
                        HostplaneError::internal(format!("accept failed: {}", e))
                    })?;

                    if self.at_capacity() {
                        self.metrics.connection_rejected();
                        tracing::warn!(peer = %addr, "connection limit reached, closing socket");
                        drop(stream);
                        continue;
                    }

                    if self.config.nodelay {
                        let _ = stream.set_nodelay(true);
                    }

                    let id = self.next_connection_id();
                    self.metrics.connection_accepted();
                    return Ok(Some((id, stream, addr)));
                }
                _ = shutdown_rx.changed() => {
                    return Ok(None);
                }
            }
        }
    }

    /// Accept connections until shutdown, serving each on its own task.
    pub async fn run(self: Arc<Self>, listener: TokioTcpListener, master: Arc<Master>) -> HostplaneResult<()> {
        tracing::info!(bind = %self.config.bind_addr, "accepting connections");
        loop {
            let accepted = match self.accept(&listener).await {
                Ok(Some(accepted)) => accepted,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let (id, stream, peer) = accepted;
            let this = Arc::clone(&self);
            let master = Arc::clone(&master);
            let shutdown_rx = self.shutdown_rx.clone();

            tokio::spawn(async move {
                tracing::debug!(conn = %id, %peer, "connection accepted");
                match serve_connection(master, stream, peer, shutdown_rx).await {
                    Ok(stats) => {
                        this.metrics.bytes_received.fetch_add(
                            stats.bytes_received.load(Ordering::Relaxed),
                            Ordering::Relaxed,
                        );
                        this.metrics
                            .bytes_sent
                            .fetch_add(stats.bytes_sent.load(Ordering::Relaxed), Ordering::Relaxed);
                    }
                    Err(e) => {
                        tracing::debug!(conn = %id, error = %e, "connection ended with error");
                    }
                }
                this.connection_closed();
            });
        }

        self.shutdown();
        self.stopped();
        Ok(())
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        *self.state.write() = TcpListenerState::ShuttingDown;
    }

    /// Mark as stopped.
    pub fn stopped(&self) {
        *self.state.write() = TcpListenerState::Stopped;
    }

    /// Record connection closed.
    pub fn connection_closed(&self) {
        self.metrics.connection_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TcpListenerConfig {
        TcpListenerConfig::from_config(&ListenerConfig {
            bind: "127.0.0.1:0".to_string(),
            ..ListenerConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(format!("{}", ConnectionId(42)), "conn-42");
    }

    #[test]
    fn test_tcp_listener_metrics() {
        let metrics = TcpListenerMetrics::default();

        metrics.connection_accepted();
        metrics.connection_accepted();
        assert_eq!(metrics.active_connections(), 2);
        assert_eq!(metrics.connections_total.load(Ordering::Relaxed), 2);

        metrics.connection_closed();
        assert_eq!(metrics.active_connections(), 1);

        metrics.connection_rejected();
        assert_eq!(metrics.connections_rejected.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_invalid_bind_rejected() {
        let result = TcpListenerConfig::from_config(&ListenerConfig {
            bind: "not-an-address".to_string(),
            ..ListenerConfig::default()
        });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_tcp_listener_bind_and_shutdown() {
        let (tx, rx) = watch::channel(false);
        let listener = TcpListener::new(config(), rx);
        assert_eq!(listener.state(), TcpListenerState::Created);

        let tcp_listener = listener.bind().await.unwrap();
        assert_eq!(listener.state(), TcpListenerState::Listening);
        assert!(tcp_listener.local_addr().unwrap().port() > 0);

        tx.send(true).unwrap();
        assert!(listener.accept(&tcp_listener).await.unwrap().is_none());

        listener.shutdown();
        assert_eq!(listener.state(), TcpListenerState::ShuttingDown);
        listener.stopped();
        assert_eq!(listener.state(), TcpListenerState::Stopped);
    }
}
