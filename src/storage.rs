//! Storage traits and the fixed-shape table of query storages.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::database::Database;
use crate::error::QueryResult;
use crate::key::DatabaseKeyIndex;
use crate::query::Query;
use crate::revision::{Durability, Revision};

/// Storage for the values of one query.
///
/// Implemented by [`InputStorage`](crate::InputStorage),
/// [`DerivedStorage`](crate::DerivedStorage) and
/// [`InternedStorage`](crate::InternedStorage).
pub trait QueryStorage<Q: Query>: Sized + Send + Sync + 'static {
    /// Create empty storage for the query at `(group_index, query_index)`.
    fn new(group_index: u16, query_index: u16) -> Self;

    /// Current contents, in key-index order. Never triggers computation.
    fn entries(&self) -> Vec<TableEntry<Q::Key, Q::Value>>;

    /// Durability of the value stored for `key`, if any.
    fn durability(&self, key: &Q::Key) -> Option<Durability>;

    /// Drop every stored value. Key indices already handed out stay valid.
    fn sweep_all(&self);
}

/// Reading from a query storage on behalf of a database.
pub trait QueryStorageOps<DB: Database, Q: Query>: QueryStorage<Q> + DynQueryStorage<DB> {
    /// Read the value for `key`, computing or validating it as needed, and
    /// record the read as a dependency of the active query.
    fn fetch(&self, db: &DB, key: &Q::Key) -> QueryResult<Arc<Q::Value>>;
}

/// The type-erased view of a query storage used to follow dependency edges.
pub trait DynQueryStorage<DB: Database>: Any + Send + Sync {
    /// Name of the query stored here.
    fn query_name(&self) -> &'static str;

    /// Format the key at `key_index` as `name(key)`.
    fn fmt_index(&self, key_index: u32, f: &mut fmt::Formatter<'_>) -> fmt::Result;

    /// Returns true if the value at `key_index` changed after `revision`.
    ///
    /// May validate or re-execute the value to find out.
    fn maybe_changed_after(
        &self,
        db: &DB,
        key_index: u32,
        revision: Revision,
    ) -> QueryResult<bool>;

    /// Upcast for downcasting to the concrete storage.
    fn as_any(&self) -> &dyn Any;
}

/// One entry of [`QueryTable::entries`](crate::QueryTable::entries).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry<K, V> {
    /// The key.
    pub key: K,
    /// The stored value; `None` if it was never computed, was evicted or was
    /// swept.
    pub value: Option<Arc<V>>,
}

impl<K, V> TableEntry<K, V> {
    pub(crate) fn new(key: K, value: Option<Arc<V>>) -> Self {
        Self { key, value }
    }
}

/// A value together with the revision data reported to the reader.
#[derive(Debug)]
pub(crate) struct StampedValue<V> {
    pub(crate) value: Arc<V>,
    pub(crate) durability: Durability,
    pub(crate) changed_at: Revision,
}

impl<V> Clone for StampedValue<V> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            durability: self.durability,
            changed_at: self.changed_at,
        }
    }
}

type Table<DB> = Arc<dyn DynQueryStorage<DB>>;

/// Every query storage of a database, addressed by `[group][query]`.
pub struct QueryTables<DB: Database> {
    groups: Vec<Vec<Option<Table<DB>>>>,
}

impl<DB: Database> QueryTables<DB> {
    pub(crate) fn new(groups: Vec<Vec<Option<Table<DB>>>>) -> Self {
        Self { groups }
    }

    fn get(&self, group_index: u16, query_index: u16) -> Option<&Table<DB>> {
        self.groups
            .get(group_index as usize)?
            .get(query_index as usize)?
            .as_ref()
    }

    /// The concrete storage of `Q`.
    ///
    /// # Panics
    ///
    /// Panics if `Q` was not registered with the storage builder.
    pub(crate) fn typed<Q: Query>(&self) -> &Q::Storage {
        let Some(table) = self.get(Q::GROUP_INDEX, Q::QUERY_INDEX) else {
            panic!(
                "query `{}` ({}, {}) is not registered with this database",
                Q::NAME,
                Q::GROUP_INDEX,
                Q::QUERY_INDEX
            );
        };
        match table.as_any().downcast_ref::<Q::Storage>() {
            Some(storage) => storage,
            None => panic!(
                "query `{}` ({}, {}) collides with registered query `{}`",
                Q::NAME,
                Q::GROUP_INDEX,
                Q::QUERY_INDEX,
                table.query_name()
            ),
        }
    }

    pub(crate) fn fmt_index(
        &self,
        index: DatabaseKeyIndex,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self.get(index.group_index, index.query_index) {
            Some(table) => table.fmt_index(index.key_index, f),
            None => write!(f, "{:?}", index),
        }
    }

    pub(crate) fn maybe_changed_after(
        &self,
        db: &DB,
        index: DatabaseKeyIndex,
        revision: Revision,
    ) -> QueryResult<bool> {
        match self.get(index.group_index, index.query_index) {
            Some(table) => table.maybe_changed_after(db, index.key_index, revision),
            None => Ok(true),
        }
    }

    /// Names of all registered queries, in table order.
    pub fn query_names(&self) -> Vec<&'static str> {
        self.groups
            .iter()
            .flatten()
            .flatten()
            .map(|table| table.query_name())
            .collect()
    }
}

impl<DB: Database> fmt::Debug for QueryTables<DB> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryTables")
            .field("queries", &self.query_names())
            .finish()
    }
}
