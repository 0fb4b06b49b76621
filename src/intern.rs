//! Bidirectional mapping between keys and compact integer identifiers.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU32;

use parking_lot::RwLock;

use crate::key::QueryKey;

/// A dense, process-unique identifier handed out by an [`Interner`].
///
/// Ids are allocated in order starting at zero. Internally the value is
/// stored off by one so that `Option<InternId>` is the same size as `InternId`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InternId {
    value: NonZeroU32,
}

impl InternId {
    /// The maximum allowed id. This value can grow between releases, so do not
    /// rely on its exact value.
    pub const MAX: u32 = 0xFFFF_FF00;

    /// Convert this id into a `u32` value.
    #[inline]
    pub fn as_u32(self) -> u32 {
        self.value.get() - 1
    }

    /// Convert this id into a `usize` value.
    #[inline]
    pub fn as_usize(self) -> usize {
        self.as_u32() as usize
    }
}

impl From<u32> for InternId {
    /// # Panics
    ///
    /// Panics if `id` is greater than [`InternId::MAX`].
    fn from(id: u32) -> InternId {
        assert!(id <= InternId::MAX, "intern id {id} exceeds InternId::MAX");
        InternId {
            value: NonZeroU32::MIN.saturating_add(id),
        }
    }
}

impl From<usize> for InternId {
    /// # Panics
    ///
    /// Panics if `id` is greater than [`InternId::MAX`].
    fn from(id: usize) -> InternId {
        assert!(
            id <= InternId::MAX as usize,
            "intern id {id} exceeds InternId::MAX"
        );
        InternId::from(id as u32)
    }
}

impl From<InternId> for u32 {
    fn from(id: InternId) -> u32 {
        id.as_u32()
    }
}

impl fmt::Debug for InternId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InternId({})", self.as_u32())
    }
}

/// Trait implemented by the newtype ids returned from interned queries.
///
/// ```ignore
/// #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// struct NameId(InternId);
///
/// impl InternKey for NameId {
///     fn from_intern_id(id: InternId) -> Self { NameId(id) }
///     fn as_intern_id(&self) -> InternId { self.0 }
/// }
/// ```
pub trait InternKey {
    /// Create an instance of the intern key from an [`InternId`].
    fn from_intern_id(id: InternId) -> Self;

    /// Extract the [`InternId`] this key was created from.
    fn as_intern_id(&self) -> InternId;
}

impl InternKey for InternId {
    fn from_intern_id(id: InternId) -> InternId {
        id
    }

    fn as_intern_id(&self) -> InternId {
        *self
    }
}

struct InternTables<K, D> {
    map: HashMap<K, InternId, ahash::RandomState>,
    entries: Vec<(K, D)>,
}

impl<K, D> Default for InternTables<K, D> {
    fn default() -> Self {
        Self {
            map: HashMap::with_hasher(ahash::RandomState::new()),
            entries: Vec::new(),
        }
    }
}

/// Thread-safe bidirectional map between keys and [`InternId`]s.
///
/// The same key always yields the same id for the lifetime of the interner
/// (until [`clear`](Interner::clear)), and different keys never share an id.
/// Each entry can carry a small payload `D` recorded when it is first
/// interned; the interned query storage uses it to remember the revision.
pub struct Interner<K, D = ()> {
    tables: RwLock<InternTables<K, D>>,
}

impl<K, D> Default for Interner<K, D> {
    fn default() -> Self {
        Self {
            tables: RwLock::new(InternTables::default()),
        }
    }
}

impl<K: QueryKey> Interner<K> {
    /// Create an empty interner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the id for `key`, allocating a new one if it was never seen.
    pub fn intern(&self, key: K) -> InternId {
        self.intern_with(key, |_| ()).0
    }
}

impl<K: QueryKey, D: Clone> Interner<K, D> {
    /// Fetch the id for `key`, or allocate one and record `data(id)` with it.
    ///
    /// Returns the id together with the payload stored for it.
    pub(crate) fn intern_with(&self, key: K, data: impl FnOnce(InternId) -> D) -> (InternId, D) {
        {
            let tables = self.tables.read();
            if let Some(&id) = tables.map.get(&key) {
                return (id, tables.entries[id.as_usize()].1.clone());
            }
        }

        let mut tables = self.tables.write();
        let next = tables.entries.len();
        let tables = &mut *tables;
        match tables.map.entry(key) {
            // Another thread interned the key between our read and write locks.
            Entry::Occupied(entry) => {
                let id = *entry.get();
                (id, tables.entries[id.as_usize()].1.clone())
            }
            Entry::Vacant(entry) => {
                let id = InternId::from(next);
                let data = data(id);
                tables.entries.push((entry.key().clone(), data.clone()));
                entry.insert(id);
                (id, data)
            }
        }
    }

    /// The id of `key`, if it was interned.
    pub fn get(&self, key: &K) -> Option<InternId> {
        self.tables.read().map.get(key).copied()
    }

    /// Look up the key and payload recorded for `id`.
    pub(crate) fn lookup_with(&self, id: InternId) -> Option<(K, D)> {
        self.tables.read().entries.get(id.as_usize()).cloned()
    }

    /// Look up the key that was interned as `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not handed out by this interner. That is a
    /// programming error, not a recoverable condition.
    pub fn lookup(&self, id: InternId) -> K {
        match self.try_lookup(id) {
            Some(key) => key,
            None => panic!("{id:?} is unknown to this interner"),
        }
    }

    /// Look up the key that was interned as `id`, if any.
    pub fn try_lookup(&self, id: InternId) -> Option<K> {
        self.tables
            .read()
            .entries
            .get(id.as_usize())
            .map(|(key, _)| key.clone())
    }

    /// Returns the ids and keys in allocation order.
    pub fn entries(&self) -> Vec<(InternId, K)> {
        self.tables
            .read()
            .entries
            .iter()
            .enumerate()
            .map(|(index, (key, _))| (InternId::from(index), key.clone()))
            .collect()
    }

    /// Number of interned keys.
    pub fn len(&self) -> usize {
        self.tables.read().entries.len()
    }

    /// Returns true if nothing has been interned.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every mapping. Previously returned ids become unknown.
    pub fn clear(&self) {
        let mut tables = self.tables.write();
        tables.map.clear();
        tables.entries.clear();
    }
}
