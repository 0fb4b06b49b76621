//! The database trait and the storage a host database owns.

use std::fmt;
use std::sync::Arc;

use crate::derived::DerivedStorage;
use crate::error::Cancelled;
use crate::event::{Event, EventKind};
use crate::query::Query;
use crate::revision::Durability;
use crate::runtime::Runtime;
use crate::storage::{DynQueryStorage, QueryStorage, QueryStorageOps, QueryTables};
use crate::table::{QueryTable, QueryTableMut};

/// Implemented by the host's database struct.
///
/// The struct owns a [`Storage<Self>`] and hands it out through
/// [`storage`](Database::storage) and [`storage_mut`](Database::storage_mut).
/// Everything else has a default implementation.
///
/// ```ignore
/// struct MyDatabase {
///     storage: Storage<Self>,
/// }
///
/// impl Database for MyDatabase {
///     fn storage(&self) -> &Storage<Self> { &self.storage }
///     fn storage_mut(&mut self) -> &mut Storage<Self> { &mut self.storage }
/// }
/// ```
pub trait Database: Sized + 'static {
    /// The storage of this database.
    fn storage(&self) -> &Storage<Self>;

    /// Mutable access to the storage; used by writes.
    fn storage_mut(&mut self) -> &mut Storage<Self>;

    /// Observer hook, called synchronously for every [`Event`].
    ///
    /// Must not write to the database.
    fn on_event(&self, event: Event) {
        let _ = event;
    }

    /// The runtime of this handle.
    fn runtime(&self) -> &Runtime {
        self.storage().runtime()
    }

    /// Read access to the table of `Q`.
    fn query<Q>(&self) -> QueryTable<'_, Self, Q>
    where
        Q: Query,
        Q::Storage: QueryStorageOps<Self, Q>,
    {
        QueryTable::new(self, self.storage().tables().typed::<Q>())
    }

    /// Write access to the table of `Q`.
    fn query_mut<Q>(&mut self) -> QueryTableMut<'_, Self, Q>
    where
        Q: Query,
    {
        QueryTableMut::new(self)
    }

    /// Fails with [`Cancelled::PendingWrite`] if a write is waiting for this
    /// handle.
    ///
    /// Called automatically before every query read; long-running query
    /// functions can call it at their own safe points.
    fn unwind_if_cancelled(&self) -> Result<(), Cancelled> {
        self.on_event(Event {
            runtime_id: self.runtime().id(),
            kind: EventKind::WillCheckCancellation,
        });
        self.runtime().unwind_if_cancelled()
    }

    /// Start a new revision as if an input of the given durability changed,
    /// without changing any value.
    ///
    /// Every memoized value of that durability or lower will be revalidated on
    /// its next read.
    fn synthetic_write(&mut self, durability: Durability) {
        tracing::debug!(?durability, "synthetic write");
        self.storage_mut()
            .runtime_mut()
            .with_incremented_revision(|_| Some(durability));
    }
}

/// The state a database owns: its runtime and the query tables.
///
/// Snapshots share the tables and get a runtime of their own.
pub struct Storage<DB: Database> {
    runtime: Runtime,
    tables: Arc<QueryTables<DB>>,
}

impl<DB: Database> Storage<DB> {
    /// Start registering queries.
    pub fn builder() -> StorageBuilder<DB> {
        StorageBuilder::default()
    }

    /// The runtime of this handle.
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Mutable access to the runtime.
    pub fn runtime_mut(&mut self) -> &mut Runtime {
        &mut self.runtime
    }

    /// The query tables.
    pub fn tables(&self) -> &Arc<QueryTables<DB>> {
        &self.tables
    }

    /// Create storage for a snapshot: same tables, new runtime.
    ///
    /// Writes on the original handle block until the returned storage is
    /// dropped.
    ///
    /// # Panics
    ///
    /// Panics if called while a query is executing on this handle.
    pub fn snapshot(&self) -> Self {
        Self {
            runtime: self.runtime.snapshot(),
            tables: self.tables.clone(),
        }
    }
}

impl<DB: Database> fmt::Debug for Storage<DB> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("runtime", &self.runtime)
            .field("tables", &self.tables)
            .finish()
    }
}

/// Builder for [`Storage`]: registers each query at its `(group, query)`
/// index and configures LRU capacities.
///
/// ```ignore
/// let storage = Storage::<MyDatabase>::builder()
///     .query::<SourceText>()
///     .query::<Parse>()
///     .lru_capacity::<Parse>(128)
///     .build();
/// ```
pub struct StorageBuilder<DB: Database> {
    groups: Vec<Vec<Option<Arc<dyn DynQueryStorage<DB>>>>>,
}

impl<DB: Database> Default for StorageBuilder<DB> {
    fn default() -> Self {
        Self { groups: Vec::new() }
    }
}

impl<DB: Database> StorageBuilder<DB> {
    /// Register the storage of `Q`.
    ///
    /// # Panics
    ///
    /// Panics if another query was registered at the same index pair.
    pub fn query<Q>(mut self) -> Self
    where
        Q: Query,
        Q::Storage: QueryStorageOps<DB, Q>,
    {
        let group_index = Q::GROUP_INDEX as usize;
        let query_index = Q::QUERY_INDEX as usize;
        if self.groups.len() <= group_index {
            self.groups.resize_with(group_index + 1, Vec::new);
        }
        let group = &mut self.groups[group_index];
        if group.len() <= query_index {
            group.resize_with(query_index + 1, || None);
        }
        if let Some(existing) = &group[query_index] {
            panic!(
                "queries `{}` and `{}` are both registered at ({}, {})",
                existing.query_name(),
                Q::NAME,
                group_index,
                query_index
            );
        }

        tracing::trace!(query = Q::NAME, group_index, query_index, "registered query");
        let storage = <Q::Storage as QueryStorage<Q>>::new(Q::GROUP_INDEX, Q::QUERY_INDEX);
        group[query_index] = Some(Arc::new(storage));
        self
    }

    /// Keep at most `capacity` values of the derived query `Q` in memory.
    /// `0` (the default) keeps everything.
    ///
    /// # Panics
    ///
    /// Panics if `Q` was not registered first.
    pub fn lru_capacity<Q>(self, capacity: usize) -> Self
    where
        Q: Query<Storage = DerivedStorage<Q>>,
    {
        let storage = self
            .groups
            .get(Q::GROUP_INDEX as usize)
            .and_then(|group| group.get(Q::QUERY_INDEX as usize))
            .and_then(|table| table.as_ref())
            .and_then(|table| table.as_any().downcast_ref::<DerivedStorage<Q>>());
        match storage {
            Some(storage) => storage.set_lru_capacity(capacity),
            None => panic!(
                "register query `{}` before configuring its LRU capacity",
                Q::NAME
            ),
        }
        self
    }

    /// Finish the storage at [`Revision::START`](crate::Revision::START).
    pub fn build(self) -> Storage<DB> {
        Storage {
            runtime: Runtime::new(),
            tables: Arc::new(QueryTables::new(self.groups)),
        }
    }
}
