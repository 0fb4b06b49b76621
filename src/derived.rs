//! Storage for derived queries: memoized, validated lazily, optionally LRU-bounded.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::database::Database;
use crate::error::QueryResult;
use crate::key::DatabaseKeyIndex;
use crate::lru::Lru;
use crate::query::{Query, QueryFunction};
use crate::revision::{Durability, Revision};
use crate::storage::{DynQueryStorage, QueryStorage, QueryStorageOps, TableEntry};

mod slot;

use slot::Slot;

/// Storage for a query implementing [`QueryFunction`].
///
/// Each key gets a slot the first time it is read. The key's position in the
/// slot map is its key index, which never changes, so dependency edges stay
/// valid through eviction and sweeping.
pub struct DerivedStorage<Q: Query> {
    group_index: u16,
    query_index: u16,
    slot_map: RwLock<IndexMap<Q::Key, Arc<Slot<Q>>, ahash::RandomState>>,
    lru: Lru<Slot<Q>>,
}

impl<Q: Query> DerivedStorage<Q> {
    fn slot(&self, key: &Q::Key) -> Arc<Slot<Q>> {
        if let Some(slot) = self.slot_map.read().get(key) {
            return slot.clone();
        }

        let mut slot_map = self.slot_map.write();
        let entry = slot_map.entry(key.clone());
        let database_key_index = DatabaseKeyIndex::for_position(
            self.group_index,
            self.query_index,
            entry.index(),
            Q::NAME,
        );
        entry
            .or_insert_with(|| Arc::new(Slot::new(key.clone(), database_key_index)))
            .clone()
    }

    fn slot_at(&self, key_index: u32) -> Option<Arc<Slot<Q>>> {
        self.slot_map
            .read()
            .get_index(key_index as usize)
            .map(|(_, slot)| slot.clone())
    }

    fn slots(&self) -> Vec<Arc<Slot<Q>>> {
        self.slot_map.read().values().cloned().collect()
    }

    /// Keep at most `capacity` values in memory. `0` keeps everything.
    pub(crate) fn set_lru_capacity(&self, capacity: usize) {
        tracing::debug!(query = Q::NAME, capacity, "setting LRU capacity");
        for slot in self.lru.set_capacity(capacity) {
            slot.evict();
        }
    }

    /// Mark the value for `key` as changed in `new_revision`.
    ///
    /// Returns the durability the revision bump has to reach, or `None` if
    /// nothing was memoized.
    pub(crate) fn invalidate(&self, key: &Q::Key, new_revision: Revision) -> Option<Durability> {
        let slot = self.slot_map.read().get(key).cloned()?;
        slot.invalidate(new_revision)
    }
}

impl<Q: Query> QueryStorage<Q> for DerivedStorage<Q> {
    fn new(group_index: u16, query_index: u16) -> Self {
        Self {
            group_index,
            query_index,
            slot_map: RwLock::new(IndexMap::with_hasher(ahash::RandomState::new())),
            lru: Lru::default(),
        }
    }

    fn entries(&self) -> Vec<TableEntry<Q::Key, Q::Value>> {
        self.slots()
            .iter()
            .map(|slot| slot.as_table_entry())
            .collect()
    }

    fn durability(&self, key: &Q::Key) -> Option<Durability> {
        let slot = self.slot_map.read().get(key).cloned()?;
        slot.durability()
    }

    fn sweep_all(&self) {
        self.lru.purge();
        for slot in self.slots() {
            slot.reset();
        }
    }
}

impl<DB, Q> DynQueryStorage<DB> for DerivedStorage<Q>
where
    DB: Database,
    Q: QueryFunction<DB>,
{
    fn query_name(&self) -> &'static str {
        Q::NAME
    }

    fn fmt_index(&self, key_index: u32, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.slot_map.read().get_index(key_index as usize) {
            Some((key, _)) => write!(f, "{}({:?})", Q::NAME, key),
            None => write!(f, "{}(#{})", Q::NAME, key_index),
        }
    }

    fn maybe_changed_after(
        &self,
        db: &DB,
        key_index: u32,
        revision: Revision,
    ) -> QueryResult<bool> {
        match self.slot_at(key_index) {
            Some(slot) => slot.maybe_changed_after(db, revision),
            None => Ok(true),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<DB, Q> QueryStorageOps<DB, Q> for DerivedStorage<Q>
where
    DB: Database,
    Q: QueryFunction<DB>,
{
    fn fetch(&self, db: &DB, key: &Q::Key) -> QueryResult<Arc<Q::Value>> {
        db.unwind_if_cancelled()?;

        let slot = self.slot(key);
        match slot.read(db) {
            Ok(stamped) => {
                // Untracked values are never evicted, so they take no room.
                if self.lru.capacity() > 0 && slot.is_evictable() {
                    if let Some(evicted) = self.lru.record_use(&slot) {
                        evicted.evict();
                    }
                }
                db.runtime()
                    .report_query_read(slot.database_key_index(), stamped.durability);
                Ok(stamped.value)
            }
            Err(error) => {
                db.runtime()
                    .report_query_failure(slot.database_key_index(), &error);
                Err(error)
            }
        }
    }
}
