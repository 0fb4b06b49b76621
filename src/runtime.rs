//! The runtime behind every database handle.
//!
//! A [`Runtime`] owns the per-handle state (its id and the stack of queries
//! it is executing) and shares the process-wide state with every snapshot:
//! the revision counters, the pending-write flag and the graph of runtimes
//! blocked on each other.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::database::Database;
use crate::error::{Cancelled, Cycle, QueryError, QueryResult};
use crate::event::{Event, EventKind};
use crate::key::DatabaseKeyIndex;
use crate::revision::{AtomicRevision, Durability, DurabilityRevisions, Revision};

mod dependency_graph;
mod local_state;

use dependency_graph::DependencyGraph;
pub(crate) use dependency_graph::WaitResult;
use local_state::LocalState;

/// A unique identifier for a particular runtime.
///
/// Each snapshot gets its own id; the main handle always has id 0.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RuntimeId {
    counter: usize,
}

impl RuntimeId {
    /// The numeric value of this id.
    pub fn as_usize(self) -> usize {
        self.counter
    }
}

impl fmt::Debug for RuntimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RuntimeId({})", self.counter)
    }
}

/// Dependency information recorded while a query executed.
#[derive(Debug, Clone)]
pub(crate) struct QueryRevisions {
    /// Minimum durability of everything the query read.
    pub(crate) durability: Durability,
    pub(crate) inputs: QueryInputs,
}

/// The inputs a memoized value was computed from.
#[derive(Debug, Clone)]
pub(crate) enum QueryInputs {
    /// Every read was recorded; the value can be validated by checking them.
    Tracked(Arc<[DatabaseKeyIndex]>),
    /// The query read state the runtime cannot see; it must re-execute in
    /// every new revision.
    Untracked,
}

/// Output of [`Runtime::execute_query_implementation`].
pub(crate) struct ComputedQueryResult<V> {
    pub(crate) value: QueryResult<V>,
    pub(crate) revisions: QueryRevisions,
}

/// State shared by the main handle and all of its snapshots.
struct SharedState {
    next_id: AtomicUsize,

    /// Last-changed revision per durability; level 0 is the current revision.
    revisions: DurabilityRevisions,

    /// Set to the next revision as soon as a write starts. While it is ahead of
    /// the current revision, every outstanding read is cancelled.
    pending_revision: AtomicRevision,

    /// Number of live snapshots. A write waits until it drops to zero.
    snapshots: Mutex<usize>,
    snapshots_released: Condvar,

    dependency_graph: Mutex<DependencyGraph>,
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            next_id: AtomicUsize::new(1),
            revisions: DurabilityRevisions::new(),
            pending_revision: AtomicRevision::start(),
            snapshots: Mutex::new(0),
            snapshots_released: Condvar::new(),
            dependency_graph: Mutex::new(DependencyGraph::default()),
        }
    }
}

/// Keeps the shared revision from advancing while a snapshot is alive.
struct RevisionGuard {
    shared_state: Arc<SharedState>,
}

impl RevisionGuard {
    fn new(shared_state: &Arc<SharedState>) -> Self {
        *shared_state.snapshots.lock() += 1;
        Self {
            shared_state: shared_state.clone(),
        }
    }
}

impl Drop for RevisionGuard {
    fn drop(&mut self) {
        let mut snapshots = self.shared_state.snapshots.lock();
        *snapshots -= 1;
        if *snapshots == 0 {
            self.shared_state.snapshots_released.notify_all();
        }
    }
}

/// The cancellation flag raised for one write.
///
/// Dropped without [`commit`](Self::commit) (the write unwound), it puts the
/// pending revision back so reads stop failing with
/// [`Cancelled::PendingWrite`].
struct PendingRevision<'me> {
    shared_state: &'me SharedState,
    current: Revision,
    committed: bool,
}

impl<'me> PendingRevision<'me> {
    fn raise(shared_state: &'me SharedState, current: Revision, next: Revision) -> Self {
        shared_state.pending_revision.store(next);
        tracing::debug!(%current, %next, "cancellation flag set");
        Self {
            shared_state,
            current,
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PendingRevision<'_> {
    fn drop(&mut self) {
        if !self.committed {
            tracing::debug!(revision = %self.current, "write aborted, clearing cancellation flag");
            self.shared_state.pending_revision.store(self.current);
        }
    }
}

/// The runtime stores the revision state and the active-query stack for one
/// database handle.
pub struct Runtime {
    id: RuntimeId,

    /// `Some` for snapshots: holds the revision in place until dropped.
    revision_guard: Option<RevisionGuard>,

    local_state: LocalState,

    shared_state: Arc<SharedState>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("id", &self.id)
            .field("current_revision", &self.current_revision())
            .field("snapshot", &self.revision_guard.is_some())
            .finish()
    }
}

impl Runtime {
    /// Create a new runtime for a fresh database at [`Revision::START`].
    pub fn new() -> Self {
        Self {
            id: RuntimeId { counter: 0 },
            revision_guard: None,
            local_state: LocalState::default(),
            shared_state: Arc::new(SharedState::default()),
        }
    }

    /// Create a runtime for a snapshot of this handle.
    ///
    /// # Panics
    ///
    /// Panics if called while this runtime is executing a query.
    pub(crate) fn snapshot(&self) -> Self {
        assert!(
            !self.local_state.query_in_progress(),
            "cannot snapshot a database while a query is executing"
        );

        let revision_guard = RevisionGuard::new(&self.shared_state);
        let id = RuntimeId {
            counter: self.shared_state.next_id.fetch_add(1, Ordering::SeqCst),
        };
        tracing::debug!(?id, revision = %self.current_revision(), "created snapshot runtime");

        Self {
            id,
            revision_guard: Some(revision_guard),
            local_state: LocalState::default(),
            shared_state: self.shared_state.clone(),
        }
    }

    /// The unique identifier of this runtime.
    pub fn id(&self) -> RuntimeId {
        self.id
    }

    /// Returns true if this runtime belongs to a snapshot.
    pub fn is_snapshot(&self) -> bool {
        self.revision_guard.is_some()
    }

    /// The current revision of the database as seen by this handle.
    ///
    /// For a snapshot this never changes while the snapshot lives.
    pub fn current_revision(&self) -> Revision {
        self.shared_state.revisions.current()
    }

    /// Last revision in which an input of durability `d` or higher changed.
    pub(crate) fn last_changed_revision(&self, d: Durability) -> Revision {
        self.shared_state.revisions.last_changed(d)
    }

    /// Returns true if a write is waiting for this handle's reads to finish.
    pub fn is_current_revision_canceled(&self) -> bool {
        self.shared_state.pending_revision.load() > self.current_revision()
    }

    /// Returns the key of the innermost query this runtime is executing.
    pub fn active_query(&self) -> Option<DatabaseKeyIndex> {
        self.local_state.active_query()
    }

    /// Reports that the currently executing query read state that the runtime
    /// cannot track.
    ///
    /// The query will be re-executed in every new revision.
    pub fn report_untracked_read(&self) {
        self.local_state.report_untracked_read();
    }

    /// Acts as though the currently executing query read an input of the given
    /// durability, capping its own durability at that level.
    pub fn report_synthetic_read(&self, durability: Durability) {
        self.local_state.report_synthetic_read(durability);
    }

    /// Fails with [`Cancelled::PendingWrite`] if a write is waiting on this
    /// handle.
    pub(crate) fn unwind_if_cancelled(&self) -> Result<(), Cancelled> {
        if self.is_current_revision_canceled() {
            tracing::debug!(runtime_id = ?self.id, "revision is stale, cancelling");
            let error = QueryError::Cancelled(Cancelled::PendingWrite);
            self.local_state.report_failure(None, &error);
            return Err(Cancelled::PendingWrite);
        }
        Ok(())
    }

    /// Commit a new revision.
    ///
    /// Sets the cancellation flag, waits until every snapshot has been dropped,
    /// then runs `op` with the new revision. `op` returns the durability of
    /// the value it changed (if any); the last-changed counters are advanced up
    /// to that level. The low-durability counter always advances.
    ///
    /// # Panics
    ///
    /// Panics when called on a snapshot runtime. If `op` panics, the revision
    /// stays where it was and the cancellation flag is cleared.
    #[tracing::instrument(level = "debug", skip_all, fields(runtime_id = ?self.id))]
    pub(crate) fn with_incremented_revision(
        &mut self,
        op: impl FnOnce(Revision) -> Option<Durability>,
    ) {
        assert!(
            self.revision_guard.is_none(),
            "writes are not allowed through a snapshot"
        );

        let current = self.current_revision();
        let next = current.next();
        let pending = PendingRevision::raise(&self.shared_state, current, next);

        let mut snapshots = self.shared_state.snapshots.lock();
        while *snapshots > 0 {
            tracing::debug!(snapshots = *snapshots, "waiting for snapshots to be dropped");
            self.shared_state.snapshots_released.wait(&mut snapshots);
        }

        let durability = op(next);
        self.shared_state.revisions.advance(next, durability);
        pending.commit();
        tracing::debug!(revision = %next, ?durability, "revision committed");
    }

    /// Run `execute` as the body of the query `database_key_index`, recording
    /// every read it performs.
    ///
    /// If a nested read failed, the failure wins over whatever `execute`
    /// returned, so a body that swallows an error is never memoized.
    pub(crate) fn execute_query_implementation<DB, V>(
        &self,
        db: &DB,
        database_key_index: DatabaseKeyIndex,
        execute: impl FnOnce() -> QueryResult<V>,
    ) -> ComputedQueryResult<V>
    where
        DB: Database,
    {
        tracing::debug!(database_key = ?database_key_index.debug(db), "executing query");
        db.on_event(Event {
            runtime_id: self.id,
            kind: EventKind::WillExecute {
                database_key: database_key_index,
            },
        });

        let active_query = self.local_state.push_query(database_key_index);
        let value = execute();
        let frame = active_query.complete();

        let value = match (value, frame.poison) {
            (Ok(_), Some(error)) => Err(error),
            (value, _) => value,
        };
        let revisions = QueryRevisions {
            durability: frame.durability,
            inputs: match frame.dependencies {
                Some(dependencies) => QueryInputs::Tracked(dependencies.into_iter().collect()),
                None => QueryInputs::Untracked,
            },
        };

        ComputedQueryResult { value, revisions }
    }

    /// Record that the active query read `input`.
    pub(crate) fn report_query_read(&self, input: DatabaseKeyIndex, durability: Durability) {
        self.local_state.report_query_read(input, durability);
    }

    /// Record that a read performed by the active query failed.
    pub(crate) fn report_query_failure(&self, input: DatabaseKeyIndex, error: &QueryError) {
        self.local_state.report_failure(Some(input), error);
    }

    /// Build the cycle error for re-entering `database_key`, which this
    /// runtime is already computing.
    pub(crate) fn cycle_error<DB: Database>(
        &self,
        db: &DB,
        database_key: DatabaseKeyIndex,
    ) -> QueryError {
        let participants = self
            .local_state
            .cycle_participants(database_key)
            .unwrap_or_else(|| vec![database_key]);
        let path = participants
            .iter()
            .map(|key| format!("{:?}", key.debug(db)))
            .collect();
        let cycle = Cycle::new(participants, path);
        tracing::debug!(%cycle, "cycle detected");
        QueryError::Cycle(cycle)
    }

    /// Block until `other_id` finishes computing `database_key`.
    ///
    /// `slot_guard` is the lock guard that showed the slot in progress. It is
    /// released only after this runtime is registered as a waiter, so the
    /// owner cannot finish unseen in between. [`EventKind::WillBlockOn`] is
    /// reported after that, with no lock held.
    ///
    /// Fails with [`QueryError::Deadlock`] instead of blocking when
    /// `other_id` is itself (transitively) waiting on this runtime.
    pub(crate) fn block_on<DB, G>(
        &self,
        db: &DB,
        database_key: DatabaseKeyIndex,
        other_id: RuntimeId,
        slot_guard: G,
    ) -> QueryResult<()>
    where
        DB: Database,
    {
        let graph = self.shared_state.dependency_graph.lock();
        if let Some(deadlock) = graph.detect_deadlock(self.id, other_id, database_key) {
            tracing::debug!(%deadlock, "refusing to block");
            return Err(QueryError::Deadlock(deadlock));
        }

        tracing::debug!(runtime_id = ?self.id, ?other_id, ?database_key, "blocking");
        let on_blocked = || {
            db.on_event(Event {
                runtime_id: self.id,
                kind: EventKind::WillBlockOn {
                    other_runtime_id: other_id,
                    database_key,
                },
            })
        };
        match DependencyGraph::block_on(
            graph,
            self.id,
            database_key,
            other_id,
            slot_guard,
            on_blocked,
        ) {
            WaitResult::Completed => Ok(()),
            WaitResult::Failed(error) => Err(error),
        }
    }

    /// Wake every runtime waiting on `database_key` with `result`.
    pub(crate) fn unblock_queries_blocked_on(
        &self,
        database_key: DatabaseKeyIndex,
        result: WaitResult,
    ) {
        self.shared_state
            .dependency_graph
            .lock()
            .unblock_runtimes_blocked_on(database_key, result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send() {
        fn assert_send<T: Send>() {}
        assert_send::<Runtime>();
    }

    #[test]
    fn test_write_advances_revision() {
        let mut runtime = Runtime::new();
        assert_eq!(runtime.current_revision(), Revision::START);

        runtime.with_incremented_revision(|_| None);
        let r2 = runtime.current_revision();
        assert!(r2 > Revision::START);
        assert_eq!(runtime.last_changed_revision(Durability::HIGH), Revision::START);

        runtime.with_incremented_revision(|_| Some(Durability::HIGH));
        assert!(runtime.current_revision() > r2);
        assert_eq!(
            runtime.last_changed_revision(Durability::HIGH),
            runtime.current_revision()
        );
        assert!(!runtime.is_current_revision_canceled());
    }

    #[test]
    fn test_snapshot_ids_are_unique() {
        let runtime = Runtime::new();
        let a = runtime.snapshot();
        let b = a.snapshot();
        assert_ne!(a.id(), runtime.id());
        assert_ne!(a.id(), b.id());
        assert!(a.is_snapshot());
        assert!(!runtime.is_snapshot());
        assert_eq!(a.current_revision(), runtime.current_revision());
    }

    #[test]
    fn test_write_waits_for_snapshot_and_cancels_it() {
        let mut runtime = Runtime::new();
        let snapshot = runtime.snapshot();
        let (tx, rx) = std::sync::mpsc::channel();

        std::thread::scope(|scope| {
            scope.spawn(move || {
                // Wait until the writer has raised the flag, then let go.
                while !snapshot.is_current_revision_canceled() {
                    std::thread::yield_now();
                }
                let result = snapshot.unwind_if_cancelled();
                tx.send(result).unwrap();
                drop(snapshot);
            });
            runtime.with_incremented_revision(|_| None);
        });

        assert_eq!(rx.recv().unwrap(), Err(Cancelled::PendingWrite));
        assert_eq!(runtime.current_revision(), Revision::START.next());
    }

    #[test]
    fn test_panicking_write_clears_cancellation() {
        let mut runtime = Runtime::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            runtime.with_incremented_revision(|_| panic!("write failed"));
        }));
        assert!(result.is_err());

        assert_eq!(runtime.current_revision(), Revision::START);
        assert!(!runtime.is_current_revision_canceled());
        assert_eq!(runtime.snapshot().unwind_if_cancelled(), Ok(()));

        runtime.with_incremented_revision(|_| None);
        assert_eq!(runtime.current_revision(), Revision::START.next());
    }

    #[test]
    #[should_panic(expected = "writes are not allowed through a snapshot")]
    fn test_snapshot_cannot_write() {
        let runtime = Runtime::new();
        let mut snapshot = runtime.snapshot();
        snapshot.with_incremented_revision(|_| None);
    }
}
