//! Unit of work.
//!
//! A [`UnitOfWork`] pairs one database transaction with the change-set
//! recorded while it runs. The change-set reaches fan-out only after the
//! transaction commits, and exactly once; rollback, a failed commit or
//! simply dropping the unit discards it.

use super::change_set::{InvalidateList, Scope};
use super::fanout::{FanOut, FanOutReport};
use crate::core::error::HostplaneResult;
use crate::core::ids::{AccountId, HostId};
use crate::schema::TableId;
use std::any::Any;
use std::sync::Arc;

/// Transaction handle of the external database engine.
pub trait DatabaseTransaction: Send {
    fn commit(self: Box<Self>) -> HostplaneResult<()>;

    fn rollback(self: Box<Self>);

    /// Concrete transaction, for request handlers that run statements.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// External database engine.
pub trait Database: Send + Sync {
    fn begin(&self) -> HostplaneResult<Box<dyn DatabaseTransaction>>;
}

/// Database with nothing behind it; every transaction commits.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDatabase;

struct NoopTransaction;

impl DatabaseTransaction for NoopTransaction {
    fn commit(self: Box<Self>) -> HostplaneResult<()> {
        Ok(())
    }

    fn rollback(self: Box<Self>) {}

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Database for NoopDatabase {
    fn begin(&self) -> HostplaneResult<Box<dyn DatabaseTransaction>> {
        Ok(Box::new(NoopTransaction))
    }
}

/// One write transaction and its change-set.
pub struct UnitOfWork {
    fanout: Arc<FanOut>,
    transaction: Option<Box<dyn DatabaseTransaction>>,
    invalidations: InvalidateList,
}

impl UnitOfWork {
    /// Begin a transaction.
    pub fn begin(database: &dyn Database, fanout: Arc<FanOut>) -> HostplaneResult<Self> {
        Ok(Self {
            fanout,
            transaction: Some(database.begin()?),
            invalidations: InvalidateList::new(),
        })
    }

    /// Record a change; see [`InvalidateList::add_table`].
    pub fn add_table(
        &mut self,
        table: TableId,
        accounts: Scope<AccountId>,
        hosts: Scope<HostId>,
        sync_required: bool,
    ) {
        self.invalidations
            .add_table(table, accounts, hosts, sync_required);
    }

    pub fn invalidations(&self) -> &InvalidateList {
        &self.invalidations
    }

    /// Underlying transaction, if still open.
    pub fn transaction_mut(&mut self) -> Option<&mut (dyn DatabaseTransaction + 'static)> {
        self.transaction.as_deref_mut()
    }

    /// Commit, then deliver the change-set.
    pub fn commit(mut self) -> HostplaneResult<FanOutReport> {
        let invalidations = std::mem::take(&mut self.invalidations);
        if let Some(transaction) = self.transaction.take() {
            transaction.commit()?;
        }
        Ok(self.fanout.invalidate_tables(invalidations))
    }

    /// Roll back and discard the change-set.
    pub fn rollback(mut self) {
        self.discard();
    }

    fn discard(&mut self) {
        if let Some(transaction) = self.transaction.take() {
            transaction.rollback();
            if !self.invalidations.is_empty() {
                tracing::debug!(
                    tables = ?self.invalidations.tables(),
                    "discarding change-set of rolled back unit of work"
                );
            }
        }
        self.invalidations = InvalidateList::new();
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        self.discard();
    }
}
