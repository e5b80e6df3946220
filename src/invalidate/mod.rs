//! Invalidation core.
//!
//! - [`change_set`] - Per-unit-of-work change-set and merge rules
//! - [`fanout`] - Delivery of committed change-sets to interested sessions
//! - [`barrier`] - Host-scoped wait for daemon acknowledgements
//! - [`work`] - Unit of work pairing a database transaction with a change-set

pub mod barrier;
pub mod change_set;
pub mod fanout;
pub mod work;

pub use barrier::{BarrierOutcome, SyncBarrier, SyncObligation};
pub use change_set::{InvalidateEntry, InvalidateList, Scope};
pub use fanout::{FanOut, FanOutReport};
pub use work::{Database, DatabaseTransaction, NoopDatabase, UnitOfWork};

use crate::schema::TableId;

/// Derived cache that must be dropped when its governing tables change.
///
/// Listeners are invoked on the committing task after every session has
/// been offered the change-set, with the tables in canonical order.
pub trait CacheListener: Send + Sync {
    /// Tables changed by a committed change-set.
    fn tables_invalidated(&self, tables: &[TableId]);
}
