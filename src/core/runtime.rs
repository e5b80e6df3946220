//! Main runtime orchestration.
//!
//! The runtime coordinates component lifecycle:
//! - Start order: master state → client listener
//! - Shutdown order: client listener → master state

use crate::core::config::Config;
use crate::core::master::Master;
use crate::net::tcp::{TcpListener, TcpListenerConfig};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const LISTENER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Component health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    /// Component is starting.
    Starting,
    /// Component is healthy and operational.
    Healthy,
    /// Component has failed.
    Failed,
    /// Component is stopping.
    Stopping,
    /// Component has stopped.
    Stopped,
}

/// Health status aggregated from all components.
#[derive(Debug, Clone)]
pub struct RuntimeHealth {
    /// Session registry, barrier and fan-out.
    pub master: ComponentHealth,
    /// Client listener.
    pub listener: ComponentHealth,
}

impl Default for RuntimeHealth {
    fn default() -> Self {
        Self {
            master: ComponentHealth::Starting,
            listener: ComponentHealth::Starting,
        }
    }
}

impl RuntimeHealth {
    /// Check if the runtime is ready to serve requests.
    pub fn is_ready(&self) -> bool {
        self.master == ComponentHealth::Healthy && self.listener == ComponentHealth::Healthy
    }

    /// Check if the runtime is alive (not failed).
    pub fn is_alive(&self) -> bool {
        self.master != ComponentHealth::Failed && self.listener != ComponentHealth::Failed
    }
}

/// Hostplane runtime holding all component handles.
pub struct Runtime {
    /// Configuration.
    config: Arc<Config>,

    /// Shared server state.
    master: Option<Arc<Master>>,

    /// Client listener.
    listener: Option<Arc<TcpListener>>,

    /// Address the listener is bound to.
    local_addr: Option<SocketAddr>,

    /// Accept loop task.
    listener_handle: Option<JoinHandle<crate::core::error::HostplaneResult<()>>>,

    /// Runtime health status.
    health: RuntimeHealth,

    /// Whether the runtime is running.
    running: Arc<AtomicBool>,

    /// Shutdown signal sender.
    shutdown_tx: watch::Sender<bool>,

    /// Shutdown signal receiver.
    shutdown_rx: watch::Receiver<bool>,
}

impl Runtime {
    /// Create a new runtime with the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config: Arc::new(config),
            master: None,
            listener: None,
            local_addr: None,
            listener_handle: None,
            health: RuntimeHealth::default(),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the shared server state (if started).
    pub fn master(&self) -> Option<&Arc<Master>> {
        self.master.as_ref()
    }

    /// Get the client listener (if started).
    pub fn listener(&self) -> Option<&Arc<TcpListener>> {
        self.listener.as_ref()
    }

    /// Address the client listener is bound to (if started).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Get the current health status.
    pub fn health(&self) -> &RuntimeHealth {
        &self.health
    }

    /// Check if the runtime is ready to serve requests.
    pub fn is_ready(&self) -> bool {
        self.health.is_ready()
    }

    /// Check if the runtime is alive.
    pub fn is_alive(&self) -> bool {
        self.health.is_alive()
    }

    /// Check if the runtime is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Get a shutdown receiver for graceful shutdown coordination.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Initialize and start all runtime components.
    ///
    /// Components are started in order:
    /// 1. Master state (translator, registry, barrier, fan-out)
    /// 2. Client listener
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!(bind = %self.config.listener.bind, "starting hostplane runtime");

        self.init_master();
        self.start_listener().await?;

        self.running.store(true, Ordering::Release);
        tracing::info!("hostplane runtime started");
        Ok(())
    }

    fn init_master(&mut self) {
        tracing::debug!("initializing master state");
        let master = Master::from_config(&self.config);
        tracing::info!(
            hosts = self.config.hosts.len(),
            identities = self.config.identities.len(),
            barrier_timeout_ms = self.config.protocol.barrier_timeout_ms,
            "master state initialized"
        );
        self.master = Some(Arc::new(master));
        self.health.master = ComponentHealth::Healthy;
    }

    async fn start_listener(&mut self) -> Result<()> {
        tracing::debug!("starting client listener");
        let master = match self.master {
            Some(ref master) => Arc::clone(master),
            None => anyhow::bail!("master state not initialized"),
        };

        let listener_config = TcpListenerConfig::from_config(&self.config.listener)
            .context("invalid listener configuration")?;
        let listener = Arc::new(TcpListener::new(listener_config, self.shutdown_rx.clone()));
        let socket = match listener.bind().await {
            Ok(socket) => socket,
            Err(e) => {
                self.health.listener = ComponentHealth::Failed;
                return Err(e).context("failed to start client listener");
            }
        };
        let local_addr = socket
            .local_addr()
            .context("failed to read listener address")?;

        let accept_loop = Arc::clone(&listener);
        self.listener_handle = Some(tokio::spawn(async move {
            accept_loop.run(socket, master).await
        }));
        self.listener = Some(listener);
        self.local_addr = Some(local_addr);
        self.health.listener = ComponentHealth::Healthy;

        tracing::info!(addr = %local_addr, "client listener started");
        Ok(())
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for shutdown signal.
    pub async fn wait_for_shutdown(&mut self) {
        let mut rx = self.shutdown_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Run the runtime until shutdown.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("shutdown signal received (SIGINT)");
            }
            _ = async {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            } => {
                tracing::info!("shutdown requested by component");
            }
        }

        self.stop().await?;
        Ok(())
    }

    /// Stop all runtime components.
    ///
    /// Components are stopped in reverse order:
    /// 1. Client listener (open sessions see the shutdown signal and close)
    /// 2. Master state
    pub async fn stop(&mut self) -> Result<()> {
        tracing::info!("stopping hostplane runtime");
        self.running.store(false, Ordering::Release);

        let _ = self.shutdown_tx.send(true);

        self.stop_listener().await;
        self.stop_master();

        tracing::info!("hostplane runtime stopped");
        Ok(())
    }

    async fn stop_listener(&mut self) {
        tracing::debug!("stopping client listener");
        self.health.listener = ComponentHealth::Stopping;

        if let Some(handle) = self.listener_handle.take() {
            match tokio::time::timeout(LISTENER_STOP_TIMEOUT, handle).await {
                Ok(Ok(Ok(()))) => {
                    tracing::info!("client listener stopped");
                }
                Ok(Ok(Err(e))) => {
                    tracing::warn!(error = %e, "client listener stopped with error");
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "client listener task panicked");
                }
                Err(_) => {
                    tracing::warn!("client listener stop timed out");
                }
            }
        }

        self.health.listener = ComponentHealth::Stopped;
    }

    fn stop_master(&mut self) {
        tracing::debug!("stopping master state");
        self.health.master = ComponentHealth::Stopping;
        if let Some(master) = self.master.take() {
            let stats = master.stats();
            tracing::info!(
                sessions_opened = stats.sessions_opened,
                change_sets = stats.change_sets,
                barrier_timeouts = stats.barrier_timeouts,
                "master state released"
            );
        }
        self.health.master = ComponentHealth::Stopped;
    }

    /// Start the runtime for tests (without signal handling).
    ///
    /// Returns the bound listener address.
    pub async fn start_for_tests(&mut self) -> Result<SocketAddr> {
        self.start().await?;
        self.local_addr
            .context("listener address unavailable after start")
    }

    /// Stop the runtime for tests.
    pub async fn shutdown_for_tests(&mut self) -> Result<()> {
        self.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config::from_toml(
            r#"
[listener]
bind = "127.0.0.1:0"
"#,
        )
        .unwrap()
    }

    #[test]
    fn health_defaults_not_ready() {
        let health = RuntimeHealth::default();
        assert!(!health.is_ready());
        assert!(health.is_alive());
    }

    #[test]
    fn health_failed_component_not_alive() {
        let health = RuntimeHealth {
            master: ComponentHealth::Healthy,
            listener: ComponentHealth::Failed,
        };
        assert!(!health.is_alive());
    }

    #[tokio::test]
    async fn start_and_stop() {
        let mut runtime = Runtime::new(test_config()).unwrap();
        assert!(!runtime.is_running());

        let addr = runtime.start_for_tests().await.unwrap();
        assert!(addr.port() > 0);
        assert!(runtime.is_ready());
        assert!(runtime.is_running());
        assert!(runtime.master().is_some());

        runtime.shutdown_for_tests().await.unwrap();
        assert!(!runtime.is_running());
        assert_eq!(runtime.health().listener, ComponentHealth::Stopped);
        assert_eq!(runtime.health().master, ComponentHealth::Stopped);
    }
}
