//! Read-only database handles for other threads.

use std::fmt;
use std::ops::Deref;

use crate::database::Database;

/// A database that can hand out snapshots to other threads.
///
/// ```ignore
/// impl ParallelDatabase for MyDatabase {
///     fn snapshot(&self) -> Snapshot<Self> {
///         Snapshot::new(MyDatabase {
///             storage: self.storage.snapshot(),
///         })
///     }
/// }
/// ```
pub trait ParallelDatabase: Database + Send {
    /// Create a read-only handle to the same storage with its own runtime.
    ///
    /// The implementation must build the new database from
    /// [`Storage::snapshot`](crate::Storage::snapshot) and wrap it with
    /// [`Snapshot::new`]. While the snapshot lives, writes through `self`
    /// raise the cancellation flag and then block until it is dropped.
    ///
    /// # Panics
    ///
    /// Panics if called from inside a query.
    fn snapshot(&self) -> Snapshot<Self>;
}

/// A read-only handle to a database.
///
/// Derefs to the database, so every read works on it; writes need `&mut` and
/// are therefore unreachable.
pub struct Snapshot<DB: ParallelDatabase> {
    db: DB,
}

impl<DB: ParallelDatabase> Snapshot<DB> {
    /// Wrap a database created from [`Storage::snapshot`](crate::Storage::snapshot).
    pub fn new(db: DB) -> Self {
        debug_assert!(
            db.runtime().is_snapshot(),
            "Snapshot::new expects a database built from Storage::snapshot"
        );
        Self { db }
    }
}

impl<DB: ParallelDatabase> Deref for Snapshot<DB> {
    type Target = DB;

    fn deref(&self) -> &DB {
        &self.db
    }
}

impl<DB: ParallelDatabase + fmt::Debug> fmt::Debug for Snapshot<DB> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Snapshot").field(&self.db).finish()
    }
}
