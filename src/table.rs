//! Typed handles to one query's table.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::database::Database;
use crate::derived::DerivedStorage;
use crate::error::QueryResult;
use crate::input::InputStorage;
use crate::intern::InternKey;
use crate::interned::InternedStorage;
use crate::query::{InputQuery, Query};
use crate::revision::Durability;
use crate::storage::{QueryStorage, QueryStorageOps, TableEntry};

/// Read access to the table of `Q`, from [`Database::query`].
pub struct QueryTable<'me, DB: Database, Q: Query> {
    db: &'me DB,
    storage: &'me Q::Storage,
}

impl<'me, DB, Q> QueryTable<'me, DB, Q>
where
    DB: Database,
    Q: Query,
    Q::Storage: QueryStorageOps<DB, Q>,
{
    pub(crate) fn new(db: &'me DB, storage: &'me Q::Storage) -> Self {
        Self { db, storage }
    }

    /// Read the value for `key`.
    ///
    /// Inside a query function the read is recorded as a dependency.
    pub fn get(&self, key: Q::Key) -> QueryResult<Arc<Q::Value>> {
        self.storage.fetch(self.db, &key)
    }

    /// Current contents of the table, without computing anything.
    pub fn entries(&self) -> Vec<TableEntry<Q::Key, Q::Value>> {
        self.storage.entries()
    }

    /// Durability of the value stored for `key`, if any.
    pub fn durability(&self, key: &Q::Key) -> Option<Durability> {
        self.storage.durability(key)
    }
}

impl<DB, Q> QueryTable<'_, DB, Q>
where
    DB: Database,
    Q: Query<Storage = InternedStorage<Q>>,
    Q::Value: InternKey,
{
    /// The key that was interned as `value`.
    ///
    /// # Panics
    ///
    /// Panics if `value` was not produced by this table.
    pub fn lookup(&self, value: Q::Value) -> Q::Key {
        self.storage.lookup(self.db, value)
    }
}

/// Write access to the table of `Q`, from [`Database::query_mut`].
///
/// Every write starts a new revision. It first cancels and waits for all
/// snapshots.
pub struct QueryTableMut<'me, DB: Database, Q: Query> {
    db: &'me mut DB,
    phantom: PhantomData<fn() -> Q>,
}

impl<'me, DB: Database, Q: Query> QueryTableMut<'me, DB, Q> {
    pub(crate) fn new(db: &'me mut DB) -> Self {
        Self {
            db,
            phantom: PhantomData,
        }
    }

    /// Drop every value of this query and start a new revision.
    ///
    /// Everything that read the query is revalidated on its next read.
    pub fn sweep_all(&mut self) {
        let tables = self.db.storage().tables().clone();
        let storage = tables.typed::<Q>();
        tracing::debug!(query = Q::NAME, "sweeping all values");
        self.db
            .storage_mut()
            .runtime_mut()
            .with_incremented_revision(|_| {
                <Q::Storage as QueryStorage<Q>>::sweep_all(storage);
                Some(Durability::HIGH)
            });
    }
}

impl<DB, Q> QueryTableMut<'_, DB, Q>
where
    DB: Database,
    Q: InputQuery<Storage = InputStorage<Q>>,
{
    /// Set the value for `key` with [`InputQuery::DEFAULT_DURABILITY`].
    pub fn set(&mut self, key: Q::Key, value: Q::Value) {
        self.set_with_durability(key, value, Q::DEFAULT_DURABILITY);
    }

    /// Set the value for `key` with the given durability.
    pub fn set_with_durability(&mut self, key: Q::Key, value: Q::Value, durability: Durability) {
        let tables = self.db.storage().tables().clone();
        let storage = tables.typed::<Q>();
        tracing::debug!(query = Q::NAME, ?key, ?value, ?durability, "setting input");
        self.db
            .storage_mut()
            .runtime_mut()
            .with_incremented_revision(|new_revision| {
                storage.set(key, value, durability, new_revision)
            });
    }
}

impl<DB, Q> QueryTableMut<'_, DB, Q>
where
    DB: Database,
    Q: Query<Storage = DerivedStorage<Q>>,
{
    /// Mark the value for `key` as outdated and start a new revision.
    ///
    /// The value is re-executed on its next read, and everything that read it
    /// is revalidated.
    pub fn invalidate(&mut self, key: &Q::Key) {
        let tables = self.db.storage().tables().clone();
        let storage = tables.typed::<Q>();
        tracing::debug!(query = Q::NAME, ?key, "invalidating");
        self.db
            .storage_mut()
            .runtime_mut()
            .with_incremented_revision(|new_revision| storage.invalidate(key, new_revision));
    }

    /// Keep at most `capacity` values in memory. `0` keeps everything.
    pub fn set_lru_capacity(&mut self, capacity: usize) {
        self.db
            .storage()
            .tables()
            .typed::<Q>()
            .set_lru_capacity(capacity);
    }
}
