//! Error types for query execution.

use std::fmt;
use std::sync::Arc;

use crate::key::DatabaseKeyIndex;
use crate::runtime::RuntimeId;

/// Result of reading a query.
pub type QueryResult<T> = Result<T, QueryError>;

/// Errors that abort a query read.
///
/// None of these are cached: a query that fails is re-executed on the next read.
/// Query functions propagate them with `?`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    /// The inputs changed under this read; the work should be redone.
    ///
    /// This is the only retryable variant. Catch it at a host-chosen boundary
    /// with [`Cancelled::catch`].
    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    /// A query (directly or transitively) read itself.
    #[error(transparent)]
    Cycle(#[from] Cycle),

    /// Two or more runtimes are waiting on each other's in-progress queries.
    #[error(transparent)]
    Deadlock(#[from] Deadlock),
}

impl QueryError {
    /// Returns true if this is a [`QueryError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueryError::Cancelled(_))
    }

    /// Returns the cycle if this is a [`QueryError::Cycle`].
    pub fn cycle(&self) -> Option<&Cycle> {
        match self {
            QueryError::Cycle(cycle) => Some(cycle),
            _ => None,
        }
    }
}

/// The reason a query read was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum Cancelled {
    /// The query was operating on a revision that a pending write is about to
    /// replace.
    #[error("cancelled because of pending write")]
    PendingWrite,

    /// The query was blocked on another thread, and that thread panicked.
    #[error("cancelled because a thread this query was waiting on panicked")]
    PropagatedPanic,
}

impl Cancelled {
    /// Runs `f` and separates a cancellation from every other outcome.
    ///
    /// A cancelled read comes back as `Err(Cancelled)` so the host can retry it
    /// against the new revision. Successes, cycles and deadlocks are returned
    /// untouched inside `Ok`.
    ///
    /// ```ignore
    /// let outcome = Cancelled::catch(|| snapshot.query::<Eval>().get(file))?;
    /// ```
    pub fn catch<T, F>(f: F) -> Result<QueryResult<T>, Cancelled>
    where
        F: FnOnce() -> QueryResult<T>,
    {
        match f() {
            Err(QueryError::Cancelled(cancelled)) => Err(cancelled),
            other => Ok(other),
        }
    }
}

/// Captures the participants of a dependency cycle.
///
/// Participants are listed in execution order, starting with the query that
/// was entered twice.
#[derive(Clone, PartialEq, Eq)]
pub struct Cycle {
    participants: Arc<[DatabaseKeyIndex]>,
    path: Arc<[String]>,
}

impl Cycle {
    pub(crate) fn new(participants: Vec<DatabaseKeyIndex>, path: Vec<String>) -> Self {
        Self {
            participants: participants.into(),
            path: path.into(),
        }
    }

    /// Keys of the queries forming the cycle.
    pub fn participant_keys(&self) -> &[DatabaseKeyIndex] {
        &self.participants
    }

    /// Rendered names of the queries forming the cycle, e.g. `["a(1)", "b(1)"]`.
    pub fn all_participants(&self) -> &[String] {
        &self.path
    }

    /// Returns true if `key` takes part in this cycle.
    pub fn contains(&self, key: DatabaseKeyIndex) -> bool {
        self.participants.contains(&key)
    }
}

impl fmt::Debug for Cycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cycle")
            .field("participants", &self.path)
            .finish()
    }
}

impl fmt::Display for Cycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dependency cycle detected: {}", self.path.join(" -> "))?;
        if let Some(first) = self.path.first() {
            write!(f, " -> {}", first)?;
        }
        Ok(())
    }
}

impl std::error::Error for Cycle {}

/// One edge of a cross-thread wait cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockedOn {
    /// The runtime that is waiting.
    pub runtime_id: RuntimeId,
    /// The runtime computing the value being waited for.
    pub blocked_on: RuntimeId,
    /// The value being waited for.
    pub database_key: DatabaseKeyIndex,
}

/// A cyclic wait between runtimes on different threads.
///
/// The runtime that detects the cycle fails with this error instead of
/// blocking; the runtimes waiting on it receive the same error once it unwinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deadlock {
    edges: Arc<[BlockedOn]>,
}

impl Deadlock {
    pub(crate) fn new(edges: Vec<BlockedOn>) -> Self {
        Self {
            edges: edges.into(),
        }
    }

    /// The wait edges forming the cycle, starting with the edge that would
    /// have closed it.
    pub fn edges(&self) -> &[BlockedOn] {
        &self.edges
    }
}

impl fmt::Display for Deadlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "deadlock detected:")?;
        for edge in self.edges.iter() {
            write!(
                f,
                " [{:?} blocked on {:?} for {:?}]",
                edge.runtime_id, edge.blocked_on, edge.database_key
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for Deadlock {}
