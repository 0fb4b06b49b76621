//! Events delivered to [`Database::on_event`](crate::Database::on_event).
//!
//! Events are emitted synchronously at key points of query execution. They are
//! meant for tests and diagnostics: an observer must not write to the database
//! from inside the callback.

use std::fmt;

use crate::database::Database;
use crate::key::DatabaseKeyIndex;
use crate::runtime::RuntimeId;

/// A notable occurrence inside the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// The runtime that emitted the event. Usually the main handle's runtime,
    /// but may be a snapshot.
    pub runtime_id: RuntimeId,

    /// What sort of event it was.
    pub kind: EventKind,
}

impl Event {
    /// Returns a value that renders the event with query names instead of raw
    /// indices.
    pub fn debug<'me, DB: Database>(&'me self, db: &'me DB) -> impl fmt::Debug + 'me {
        EventDebug { event: self, db }
    }
}

/// The kinds of events the runtime emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// All inputs to a memoized value were up to date, so the value was
    /// marked verified without executing the query.
    DidValidateMemoizedValue {
        /// The value that was validated.
        database_key: DatabaseKeyIndex,
    },

    /// This runtime is about to block on another runtime that is computing
    /// `database_key`. Sent after the slot lock is released, so the observer
    /// may read the query being waited on.
    WillBlockOn {
        /// The runtime we will block on.
        other_runtime_id: RuntimeId,
        /// The value being computed by the other runtime.
        database_key: DatabaseKeyIndex,
    },

    /// The function of this query is about to run.
    WillExecute {
        /// The query being executed.
        database_key: DatabaseKeyIndex,
    },

    /// The runtime is checking whether its revision is still current.
    WillCheckCancellation,
}

struct EventDebug<'me, DB: Database> {
    event: &'me Event,
    db: &'me DB,
}

impl<DB: Database> fmt::Debug for EventDebug<'_, DB> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("Event");
        out.field("runtime_id", &self.event.runtime_id);
        match self.event.kind {
            EventKind::DidValidateMemoizedValue { database_key } => out
                .field("kind", &"DidValidateMemoizedValue")
                .field("database_key", &database_key.debug(self.db)),
            EventKind::WillBlockOn {
                other_runtime_id,
                database_key,
            } => out
                .field("kind", &"WillBlockOn")
                .field("other_runtime_id", &other_runtime_id)
                .field("database_key", &database_key.debug(self.db)),
            EventKind::WillExecute { database_key } => out
                .field("kind", &"WillExecute")
                .field("database_key", &database_key.debug(self.db)),
            EventKind::WillCheckCancellation => out.field("kind", &"WillCheckCancellation"),
        };
        out.finish()
    }
}
