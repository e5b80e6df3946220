//! Per-unit-of-work change-set.
//!
//! An [`InvalidateList`] collects, for each table touched by one write
//! transaction, which accounts and hosts are affected and whether the write
//! path needs daemons to confirm they applied the change. It is pure data:
//! the fan-out engine takes it by value after commit, so nothing can modify
//! it once delivery has started.

use crate::core::ids::{AccountId, HostId};
use crate::schema::TableId;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

/// Set of affected ids, or every id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope<T: Ord> {
    /// Every account or every host.
    All,
    /// Only the listed ids (possibly none).
    Only(BTreeSet<T>),
}

impl<T: Ord> Scope<T> {
    /// The `ALL` sentinel.
    pub fn all() -> Self {
        Self::All
    }

    /// The empty scope.
    pub fn none() -> Self {
        Self::Only(BTreeSet::new())
    }

    /// A finite scope.
    pub fn only<I, V>(ids: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<T>,
    {
        Self::Only(ids.into_iter().map(Into::into).collect())
    }

    /// Check for the `ALL` sentinel.
    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    /// Check for the empty scope.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Only(ids) if ids.is_empty())
    }

    /// Check whether `id` is covered.
    pub fn contains(&self, id: &T) -> bool {
        match self {
            Self::All => true,
            Self::Only(ids) => ids.contains(id),
        }
    }

    /// Union in place; `All` absorbs.
    pub fn merge(&mut self, other: Scope<T>) {
        match (&mut *self, other) {
            (Self::All, _) => {}
            (this, Self::All) => *this = Self::All,
            (Self::Only(mine), Self::Only(theirs)) => mine.extend(theirs),
        }
    }

    /// Finite ids, or `None` for `All`.
    pub fn ids(&self) -> Option<&BTreeSet<T>> {
        match self {
            Self::All => None,
            Self::Only(ids) => Some(ids),
        }
    }
}

impl<T: Ord> From<BTreeSet<T>> for Scope<T> {
    fn from(ids: BTreeSet<T>) -> Self {
        Self::Only(ids)
    }
}

impl<T: Ord> From<Option<T>> for Scope<T> {
    /// `None` means every id.
    fn from(id: Option<T>) -> Self {
        match id {
            Some(id) => Self::Only(BTreeSet::from([id])),
            None => Self::All,
        }
    }
}

/// Affected scope of one table within a change-set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidateEntry {
    /// Affected accounts.
    pub accounts: Scope<AccountId>,
    /// Affected hosts.
    pub hosts: Scope<HostId>,
    /// Daemons bound to affected hosts must acknowledge.
    pub sync_required: bool,
}

/// Change-set accumulated during one write transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidateList {
    entries: BTreeMap<TableId, InvalidateEntry>,
}

impl InvalidateList {
    /// Create an empty change-set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `table` changed for the given accounts and hosts.
    ///
    /// Repeated calls for one table union their scopes; `All` absorbs any
    /// finite set and `sync_required` stays set once any call sets it.
    pub fn add_table(
        &mut self,
        table: TableId,
        accounts: Scope<AccountId>,
        hosts: Scope<HostId>,
        sync_required: bool,
    ) {
        match self.entries.entry(table) {
            Entry::Vacant(slot) => {
                slot.insert(InvalidateEntry {
                    accounts,
                    hosts,
                    sync_required,
                });
            }
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                entry.accounts.merge(accounts);
                entry.hosts.merge(hosts);
                entry.sync_required |= sync_required;
            }
        }
    }

    /// Record a change visible to everyone, without sync.
    pub fn add_table_all(&mut self, table: TableId) {
        self.add_table(table, Scope::All, Scope::All, false);
    }

    /// Entry for `table`, if recorded.
    pub fn get(&self, table: TableId) -> Option<&InvalidateEntry> {
        self.entries.get(&table)
    }

    /// Entries in canonical table order.
    pub fn entries(&self) -> impl Iterator<Item = (TableId, &InvalidateEntry)> {
        self.entries.iter().map(|(table, entry)| (*table, entry))
    }

    /// Tables in canonical order.
    pub fn tables(&self) -> Vec<TableId> {
        self.entries.keys().copied().collect()
    }

    /// Check whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of tables recorded.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Union of the host scopes of every sync-required entry.
    ///
    /// Returns `None` when no entry requires sync.
    pub fn sync_hosts(&self) -> Option<Scope<HostId>> {
        self.entries
            .values()
            .filter(|entry| entry.sync_required)
            .fold(None, |acc: Option<Scope<HostId>>, entry| {
                let mut scope = acc.unwrap_or_else(Scope::none);
                scope.merge(entry.hosts.clone());
                Some(scope)
            })
    }
}
