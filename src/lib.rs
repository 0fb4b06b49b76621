//! Memoflow: an incremental, on-demand memoization engine.
//!
//! A host declares *input* queries, whose values it sets, and *derived*
//! queries, whose values are computed from other queries. Reads are memoized;
//! after a write only the values that (transitively) depend on the changed
//! input are recomputed, and only when they are read again.
//!
//! # Key Features
//!
//! - **Revisions**: every write starts a new revision; memoized values record
//!   when they were last verified and when they last changed
//! - **Early cutoff**: a recomputed value equal to the previous one keeps its
//!   old change revision, so its dependents are not re-executed
//! - **Durability**: values built only from stable inputs are revalidated in
//!   O(1) after a write to a volatile input
//! - **Snapshots**: read-only handles for other threads; writes cancel and
//!   wait for them
//! - **Cancellation as a result**: stale reads fail with
//!   [`QueryError::Cancelled`], caught at a host boundary with
//!   [`Cancelled::catch`]
//! - **Cycle detection** with optional per-query recovery, and cross-thread
//!   deadlock reporting
//! - **Interning** and per-query **LRU** eviction
//!
//! # Example
//!
//! ```ignore
//! use memoflow::{Database, DerivedStorage, InputQuery, InputStorage, Query, QueryFunction,
//!     QueryResult, Storage};
//!
//! struct Db {
//!     storage: Storage<Self>,
//! }
//!
//! impl Database for Db {
//!     fn storage(&self) -> &Storage<Self> { &self.storage }
//!     fn storage_mut(&mut self) -> &mut Storage<Self> { &mut self.storage }
//! }
//!
//! struct Input;
//! impl Query for Input {
//!     type Key = ();
//!     type Value = i64;
//!     type Storage = InputStorage<Self>;
//!     const GROUP_INDEX: u16 = 0;
//!     const QUERY_INDEX: u16 = 0;
//!     const NAME: &'static str = "input";
//! }
//! impl InputQuery for Input {}
//!
//! struct Double;
//! impl Query for Double {
//!     type Key = ();
//!     type Value = i64;
//!     type Storage = DerivedStorage<Self>;
//!     const GROUP_INDEX: u16 = 0;
//!     const QUERY_INDEX: u16 = 1;
//!     const NAME: &'static str = "double";
//! }
//! impl QueryFunction<Db> for Double {
//!     fn execute(db: &Db, _: &()) -> QueryResult<i64> {
//!         Ok(*db.query::<Input>().get(())? * 2)
//!     }
//!     fn value_eq(old: &i64, new: &i64) -> bool { old == new }
//! }
//!
//! let mut db = Db {
//!     storage: Storage::builder().query::<Input>().query::<Double>().build(),
//! };
//! db.query_mut::<Input>().set((), 21);
//! assert_eq!(*db.query::<Double>().get(())?, 42);
//! ```

#![warn(missing_docs)]

mod database;
mod derived;
mod error;
mod event;
mod input;
mod intern;
mod interned;
mod key;
mod lru;
mod query;
mod revision;
mod runtime;
mod snapshot;
mod storage;
mod table;
pub mod value_eq;

pub use database::{Database, Storage, StorageBuilder};
pub use derived::DerivedStorage;
pub use error::{BlockedOn, Cancelled, Cycle, Deadlock, QueryError, QueryResult};
pub use event::{Event, EventKind};
pub use input::InputStorage;
pub use intern::{InternId, InternKey, Interner};
pub use interned::InternedStorage;
pub use key::{DatabaseKeyIndex, QueryKey};
pub use query::{InputQuery, Query, QueryFunction};
pub use revision::{Durability, Revision};
pub use runtime::{Runtime, RuntimeId};
pub use snapshot::{ParallelDatabase, Snapshot};
pub use storage::{DynQueryStorage, QueryStorage, QueryStorageOps, QueryTables, TableEntry};
pub use table::{QueryTable, QueryTableMut};
