//! Traits a host implements to declare its queries.

use std::fmt::Debug;

use crate::database::Database;
use crate::error::{Cycle, QueryResult};
use crate::key::QueryKey;
use crate::revision::Durability;
use crate::storage::QueryStorage;

/// A query: a keyed, memoized value stored in one table of the database.
///
/// `GROUP_INDEX` and `QUERY_INDEX` address the query's table and must be
/// unique per database and stable for the lifetime of the process. The kind of
/// query is chosen by `Storage`:
///
/// - [`InputStorage`](crate::InputStorage) for input queries, which also
///   implement [`InputQuery`]
/// - [`DerivedStorage`](crate::DerivedStorage) for derived queries, which also
///   implement [`QueryFunction`]
/// - [`InternedStorage`](crate::InternedStorage) for interned queries, whose
///   value implements [`InternKey`](crate::InternKey)
///
/// # Example
///
/// ```ignore
/// struct Length;
///
/// impl Query for Length {
///     type Key = String;
///     type Value = usize;
///     type Storage = DerivedStorage<Self>;
///
///     const GROUP_INDEX: u16 = 0;
///     const QUERY_INDEX: u16 = 1;
///     const NAME: &'static str = "length";
/// }
///
/// impl QueryFunction<MyDatabase> for Length {
///     fn execute(db: &MyDatabase, key: &String) -> QueryResult<usize> {
///         Ok(db.query::<SourceText>().get(key.clone())?.len())
///     }
///
///     fn value_eq(old: &usize, new: &usize) -> bool {
///         old == new
///     }
/// }
/// ```
pub trait Query: Sized + 'static {
    /// The key the query is called with.
    type Key: QueryKey;

    /// The value the query produces.
    type Value: Debug + Send + Sync + 'static;

    /// Where the values of this query live.
    type Storage: QueryStorage<Self>;

    /// Index of the group this query belongs to.
    const GROUP_INDEX: u16;

    /// Index of the query within its group.
    const QUERY_INDEX: u16;

    /// Name used in logs, events and cycle reports.
    const NAME: &'static str;
}

/// An input query: its values are set by the host and never computed.
pub trait InputQuery: Query {
    /// Durability used by [`QueryTableMut::set`](crate::QueryTableMut::set)
    /// and for default values.
    const DEFAULT_DURABILITY: Durability = Durability::LOW;

    /// Value returned for a key that was never set.
    ///
    /// Reading an unset key without a default is a programming error and
    /// panics.
    fn default_value(_key: &Self::Key) -> Option<Self::Value> {
        None
    }
}

/// A derived query: its values are computed from other queries and memoized.
pub trait QueryFunction<DB: Database>: Query {
    /// Compute the value for `key`.
    ///
    /// Every query read through `db` is recorded as a dependency. Failures of
    /// those reads must be propagated; a failure that is swallowed still fails
    /// this query and nothing is memoized.
    fn execute(db: &DB, key: &Self::Key) -> QueryResult<Self::Value>;

    /// Returns true if a recomputed value is the same as the previous one.
    ///
    /// When it is, the value keeps its old change revision and queries that
    /// depend on it are not re-executed. Values without a meaningful equality
    /// return `false`, see [`value_eq::never`](crate::value_eq::never).
    fn value_eq(old_value: &Self::Value, new_value: &Self::Value) -> bool;

    /// Fallback value when this query takes part in a dependency cycle.
    ///
    /// The innermost participant that returns `Some` breaks the cycle: its
    /// fallback is memoized and the queries above it continue normally.
    fn recover(_db: &DB, _cycle: &Cycle, _key: &Self::Key) -> Option<Self::Value> {
        None
    }
}
