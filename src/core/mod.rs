//! Core runtime infrastructure.
//!
//! - [`config`] - Configuration parsing and validation
//! - [`error`] - Error types and wire status mapping
//! - [`ids`] - Identifier newtypes
//! - [`master`] - Shared server state
//! - [`runtime`] - Main runtime orchestration

pub mod config;
pub mod error;
pub mod ids;
pub mod master;
pub mod runtime;
