//! Networking.
//!
//! - [`tcp`] - Client TCP listener and accept loop

pub mod tcp;

pub use tcp::{ConnectionId, TcpListener, TcpListenerConfig, TcpListenerMetrics, TcpListenerState};
