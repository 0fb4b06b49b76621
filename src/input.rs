//! Storage for input queries.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::database::Database;
use crate::error::QueryResult;
use crate::key::DatabaseKeyIndex;
use crate::query::{InputQuery, Query};
use crate::revision::{Durability, Revision};
use crate::storage::{DynQueryStorage, QueryStorage, QueryStorageOps, StampedValue, TableEntry};

/// Storage for a query implementing [`InputQuery`].
///
/// Values only change through
/// [`QueryTableMut::set`](crate::QueryTableMut::set); they are never evicted
/// and never revalidated.
pub struct InputStorage<Q: Query> {
    group_index: u16,
    query_index: u16,
    slots: RwLock<IndexMap<Q::Key, Arc<InputSlot<Q::Value>>, ahash::RandomState>>,
}

struct InputSlot<V> {
    database_key_index: DatabaseKeyIndex,
    stamped_value: RwLock<Option<StampedValue<V>>>,
}

impl<Q: Query> InputStorage<Q> {
    fn slot(&self, key: &Q::Key) -> Arc<InputSlot<Q::Value>> {
        if let Some(slot) = self.slots.read().get(key) {
            return slot.clone();
        }

        let mut slots = self.slots.write();
        let entry = slots.entry(key.clone());
        let database_key_index = DatabaseKeyIndex::for_position(
            self.group_index,
            self.query_index,
            entry.index(),
            Q::NAME,
        );
        entry
            .or_insert_with(|| {
                Arc::new(InputSlot {
                    database_key_index,
                    stamped_value: RwLock::new(None),
                })
            })
            .clone()
    }

    /// Store `value` as changed in `new_revision`.
    ///
    /// Returns the durability of the value it replaces: readers of the old
    /// value must see the change even when the new durability is higher.
    pub(crate) fn set(
        &self,
        key: Q::Key,
        value: Q::Value,
        durability: Durability,
        new_revision: Revision,
    ) -> Option<Durability> {
        let slot = self.slot(&key);
        let mut stamped_value = slot.stamped_value.write();
        let old_durability = stamped_value.as_ref().map(|old| old.durability);
        *stamped_value = Some(StampedValue {
            value: Arc::new(value),
            durability,
            changed_at: new_revision,
        });
        old_durability
    }
}

impl<Q: Query> QueryStorage<Q> for InputStorage<Q> {
    fn new(group_index: u16, query_index: u16) -> Self {
        Self {
            group_index,
            query_index,
            slots: RwLock::new(IndexMap::with_hasher(ahash::RandomState::new())),
        }
    }

    fn entries(&self) -> Vec<TableEntry<Q::Key, Q::Value>> {
        self.slots
            .read()
            .iter()
            .map(|(key, slot)| {
                let value = slot
                    .stamped_value
                    .read()
                    .as_ref()
                    .map(|stamped| stamped.value.clone());
                TableEntry::new(key.clone(), value)
            })
            .collect()
    }

    fn durability(&self, key: &Q::Key) -> Option<Durability> {
        let slot = self.slots.read().get(key).cloned()?;
        let stamped_value = slot.stamped_value.read();
        stamped_value.as_ref().map(|stamped| stamped.durability)
    }

    fn sweep_all(&self) {
        for slot in self.slots.read().values() {
            *slot.stamped_value.write() = None;
        }
    }
}

impl<DB, Q> DynQueryStorage<DB> for InputStorage<Q>
where
    DB: Database,
    Q: InputQuery,
{
    fn query_name(&self) -> &'static str {
        Q::NAME
    }

    fn fmt_index(&self, key_index: u32, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.slots.read().get_index(key_index as usize) {
            Some((key, _)) => write!(f, "{}({:?})", Q::NAME, key),
            None => write!(f, "{}(#{})", Q::NAME, key_index),
        }
    }

    fn maybe_changed_after(
        &self,
        _db: &DB,
        key_index: u32,
        revision: Revision,
    ) -> QueryResult<bool> {
        let Some(slot) = self
            .slots
            .read()
            .get_index(key_index as usize)
            .map(|(_, slot)| slot.clone())
        else {
            return Ok(true);
        };
        let stamped_value = slot.stamped_value.read();
        Ok(match &*stamped_value {
            Some(stamped) => stamped.changed_at > revision,
            None => true,
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<DB, Q> QueryStorageOps<DB, Q> for InputStorage<Q>
where
    DB: Database,
    Q: InputQuery,
{
    fn fetch(&self, db: &DB, key: &Q::Key) -> QueryResult<Arc<Q::Value>> {
        db.unwind_if_cancelled()?;

        let slot = self.slot(key);
        let stamped = {
            let current = slot.stamped_value.read().clone();
            match current {
                Some(stamped) => stamped,
                None => self.store_default(db, &slot, key),
            }
        };

        tracing::trace!(
            query = Q::NAME,
            ?key,
            changed_at = %stamped.changed_at,
            "read input"
        );
        db.runtime()
            .report_query_read(slot.database_key_index, stamped.durability);
        Ok(stamped.value)
    }
}

impl<Q: InputQuery> InputStorage<Q> {
    /// Fill an unset slot with the query's default value.
    ///
    /// # Panics
    ///
    /// Panics if the query has no default for `key`.
    fn store_default<DB: Database>(
        &self,
        db: &DB,
        slot: &InputSlot<Q::Value>,
        key: &Q::Key,
    ) -> StampedValue<Q::Value> {
        let mut stamped_value = slot.stamped_value.write();
        if let Some(stamped) = &*stamped_value {
            return stamped.clone();
        }
        let Some(value) = Q::default_value(key) else {
            panic!("no value set for input `{}({:?})`", Q::NAME, key);
        };

        let stamped = StampedValue {
            value: Arc::new(value),
            durability: Q::DEFAULT_DURABILITY,
            changed_at: db.runtime().current_revision(),
        };
        tracing::debug!(query = Q::NAME, ?key, "using default value");
        *stamped_value = Some(stamped.clone());
        stamped
    }
}
