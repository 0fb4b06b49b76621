//! Storage for interned queries.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::database::Database;
use crate::error::QueryResult;
use crate::intern::{InternId, InternKey, Interner};
use crate::key::DatabaseKeyIndex;
use crate::query::Query;
use crate::revision::{Durability, Revision};
use crate::storage::{DynQueryStorage, QueryStorage, QueryStorageOps, TableEntry};

/// Storage for an interned query: maps each key to a compact id of type
/// `Q::Value`.
///
/// Reading interns the key. [`QueryTable::lookup`](crate::QueryTable::lookup)
/// maps an id back to its key. Ids are only reclaimed by
/// [`sweep_all`](crate::QueryTableMut::sweep_all).
pub struct InternedStorage<Q: Query> {
    group_index: u16,
    query_index: u16,
    /// Each id remembers the revision it was first interned in.
    interner: Interner<Q::Key, Revision>,
}

impl<Q: Query> InternedStorage<Q>
where
    Q::Value: InternKey,
{
    fn database_key_index(&self, id: InternId) -> DatabaseKeyIndex {
        DatabaseKeyIndex::new(self.group_index, self.query_index, id.as_u32())
    }

    pub(crate) fn lookup<DB: Database>(&self, db: &DB, value: Q::Value) -> Q::Key {
        let id = value.as_intern_id();
        let Some((key, _)) = self.interner.lookup_with(id) else {
            panic!("{id:?} is unknown to interned query `{}`", Q::NAME);
        };
        db.runtime()
            .report_query_read(self.database_key_index(id), Durability::HIGH);
        key
    }
}

impl<Q: Query> QueryStorage<Q> for InternedStorage<Q>
where
    Q::Value: InternKey,
{
    fn new(group_index: u16, query_index: u16) -> Self {
        Self {
            group_index,
            query_index,
            interner: Interner::default(),
        }
    }

    fn entries(&self) -> Vec<TableEntry<Q::Key, Q::Value>> {
        self.interner
            .entries()
            .into_iter()
            .map(|(id, key)| TableEntry::new(key, Some(Arc::new(Q::Value::from_intern_id(id)))))
            .collect()
    }

    fn durability(&self, key: &Q::Key) -> Option<Durability> {
        self.interner.get(key).map(|_| Durability::HIGH)
    }

    fn sweep_all(&self) {
        self.interner.clear();
    }
}

impl<DB, Q> DynQueryStorage<DB> for InternedStorage<Q>
where
    DB: Database,
    Q: Query,
    Q::Value: InternKey,
{
    fn query_name(&self) -> &'static str {
        Q::NAME
    }

    fn fmt_index(&self, key_index: u32, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.interner.try_lookup(InternId::from(key_index)) {
            Some(key) => write!(f, "{}({:?})", Q::NAME, key),
            None => write!(f, "{}(#{})", Q::NAME, key_index),
        }
    }

    fn maybe_changed_after(
        &self,
        _db: &DB,
        key_index: u32,
        revision: Revision,
    ) -> QueryResult<bool> {
        Ok(match self.interner.lookup_with(InternId::from(key_index)) {
            Some((_, interned_at)) => interned_at > revision,
            None => true,
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<DB, Q> QueryStorageOps<DB, Q> for InternedStorage<Q>
where
    DB: Database,
    Q: Query,
    Q::Value: InternKey,
{
    fn fetch(&self, db: &DB, key: &Q::Key) -> QueryResult<Arc<Q::Value>> {
        db.unwind_if_cancelled()?;

        let revision_now = db.runtime().current_revision();
        let (id, interned_at) = self.interner.intern_with(key.clone(), |_| revision_now);
        tracing::trace!(query = Q::NAME, ?key, ?id, %interned_at, "interned");

        db.runtime()
            .report_query_read(self.database_key_index(id), Durability::HIGH);
        Ok(Arc::new(Q::Value::from_intern_id(id)))
    }
}
