//! Hostplane - master control plane for a multi-tenant hosting platform.
//!
//! Administrative tools and per-host daemons hold long-lived connections to
//! the master. Every committed change to the shared data model is pushed back
//! to the connected sessions allowed to see it, as a batch of table
//! identifiers in each client's own protocol numbering. Changes that per-host
//! daemons must apply before a request can complete carry a sync id; the
//! request waits until every daemon on the affected hosts has acknowledged it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Administrative tools / host daemons            │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │ TCP
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Client protocol                         │
//! │       handshake │ request dispatch │ invalidation push          │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Invalidation core                         │
//! │   unit of work │ change-set │ fan-out │ sync barrier            │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │          Session registry │ table translator │ access control   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::error`] - Error types and wire status mapping
//! - [`core::master`] - Shared server state
//! - [`core::runtime`] - Main runtime orchestration
//!
//! ## Invalidation
//! - [`invalidate::change_set`] - Change-set accumulation
//! - [`invalidate::fanout`] - Per-session filtering and delivery
//! - [`invalidate::barrier`] - Synchronization barrier
//! - [`invalidate::work`] - Unit of work over a database transaction
//!
//! ## Sessions and metadata
//! - [`session`] - Sessions and the session registry
//! - [`schema`] - Table identities, protocol versions, ordinal translation
//! - [`access`] - Access control and hostname lookup
//!
//! ## Networking
//! - [`protocol`] - Wire codec, handshake, dispatch, connection task
//! - [`net::tcp`] - Client listener
//!
//! ## CLI
//! - [`cli::commands`] - CLI command implementations

// Core infrastructure
pub mod core;

// Invalidation core
pub mod invalidate;

// Sessions, schema metadata and access control
pub mod access;
pub mod schema;
pub mod session;

// Networking
pub mod net;
pub mod protocol;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, error, master, runtime};
pub use self::core::ids::{AccountId, ConnectorId, HostId, Identity, SessionId};
pub use self::core::master::Master;
pub use invalidate::{barrier, change_set, fanout, work};
