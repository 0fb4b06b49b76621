//! Key types for addressing memoized values.

use std::fmt::{self, Debug};
use std::hash::Hash;

use crate::database::Database;

/// Convenience trait for types that can be used as query keys.
///
/// This combines all the bounds a key needs to be stored in a query table and
/// shared across snapshots: `Hash + Eq + Clone + Debug + Send + Sync + 'static`.
pub trait QueryKey: Hash + Eq + Clone + Debug + Send + Sync + 'static {}
impl<T: Hash + Eq + Clone + Debug + Send + Sync + 'static> QueryKey for T {}

/// A uniquely addressable coordinate for any memoized value.
///
/// Made of the group index and query index declared by the query, plus the
/// index of the key inside that query's table. Key indices are dense and stay
/// stable for as long as the key lives in its table, so dependency edges can
/// refer to values without holding or comparing the keys themselves.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DatabaseKeyIndex {
    pub(crate) group_index: u16,
    pub(crate) query_index: u16,
    pub(crate) key_index: u32,
}

impl DatabaseKeyIndex {
    pub(crate) const fn new(group_index: u16, query_index: u16, key_index: u32) -> Self {
        Self {
            group_index,
            query_index,
            key_index,
        }
    }

    /// The index of the key at `position` in the table of `query`.
    ///
    /// # Panics
    ///
    /// Panics if the table holds more than `u32::MAX + 1` keys.
    pub(crate) fn for_position(
        group_index: u16,
        query_index: u16,
        position: usize,
        query: &str,
    ) -> Self {
        match u32::try_from(position) {
            Ok(key_index) => Self::new(group_index, query_index, key_index),
            Err(_) => panic!("query `{query}` has more keys than a key index can address"),
        }
    }

    /// Returns the index of the query group containing this key.
    #[inline]
    pub fn group_index(self) -> u16 {
        self.group_index
    }

    /// Returns the index of the query within its query group.
    #[inline]
    pub fn query_index(self) -> u16 {
        self.query_index
    }

    /// Returns the index of this particular key within the query's table.
    #[inline]
    pub fn key_index(self) -> u32 {
        self.key_index
    }

    /// Returns a value that renders this key as `query_name(key)`.
    pub fn debug<'me, DB: Database>(self, db: &'me DB) -> impl Debug + 'me {
        DatabaseKeyDebug { index: self, db }
    }
}

impl Debug for DatabaseKeyIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DatabaseKeyIndex({}, {}, {})",
            self.group_index, self.query_index, self.key_index
        )
    }
}

struct DatabaseKeyDebug<'me, DB: Database> {
    index: DatabaseKeyIndex,
    db: &'me DB,
}

impl<DB: Database> Debug for DatabaseKeyDebug<'_, DB> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.db.storage().tables().fmt_index(self.index, f)
    }
}
