//! CLI command implementations.

mod config;
mod hash_password;
mod start;
mod tables;

pub use config::{render_config, run_config, ConfigArgs, ConfigCommand};
pub use hash_password::{hash_password, run_hash_password, HashPasswordArgs};
pub use start::{run_start_with_config, StartArgs};
pub use tables::{render_tables, run_tables, TablesArgs};
