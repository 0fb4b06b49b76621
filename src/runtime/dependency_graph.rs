//! The wait-for graph between runtimes of one database.
//!
//! A runtime that finds a slot in progress on another runtime adds an edge
//! here before it sleeps. Following the edges from the owner back to the
//! waiter means the wait would never end, which is reported as a deadlock.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, MutexGuard};

use crate::error::{BlockedOn, Deadlock, QueryError};
use crate::key::DatabaseKeyIndex;
use crate::runtime::RuntimeId;

/// How a wait on another runtime ended.
#[derive(Debug, Clone)]
pub(crate) enum WaitResult {
    /// The value was published; fetch it again.
    Completed,
    /// The computation failed and nothing was published.
    Failed(QueryError),
}

/// Which runtime is waiting on which, across all handles of one database.
#[derive(Default)]
pub(super) struct DependencyGraph {
    /// A runtime `from` is blocked on `edges[from].blocked_on_id`.
    edges: HashMap<RuntimeId, Edge, ahash::RandomState>,

    /// The runtimes waiting for each in-progress key.
    query_dependents: HashMap<DatabaseKeyIndex, Vec<RuntimeId>, ahash::RandomState>,

    /// Results handed to woken runtimes, removed by the runtime itself.
    wait_results: HashMap<RuntimeId, WaitResult, ahash::RandomState>,
}

struct Edge {
    blocked_on_id: RuntimeId,
    blocked_on_key: DatabaseKeyIndex,
    condvar: Arc<Condvar>,
}

impl DependencyGraph {
    /// Returns the wait cycle that `from_id` blocking on `to_id` would close,
    /// if any.
    pub(super) fn detect_deadlock(
        &self,
        from_id: RuntimeId,
        to_id: RuntimeId,
        database_key: DatabaseKeyIndex,
    ) -> Option<Deadlock> {
        let mut edges = vec![BlockedOn {
            runtime_id: from_id,
            blocked_on: to_id,
            database_key,
        }];
        let mut current = to_id;
        while let Some(edge) = self.edges.get(&current) {
            edges.push(BlockedOn {
                runtime_id: current,
                blocked_on: edge.blocked_on_id,
                database_key: edge.blocked_on_key,
            });
            if edge.blocked_on_id == from_id {
                return Some(Deadlock::new(edges));
            }
            current = edge.blocked_on_id;
        }
        None
    }

    /// Register `from_id` as waiting for `to_id` to finish `database_key`,
    /// release `slot_guard`, and sleep until woken.
    ///
    /// `on_blocked` runs once registered, with neither the slot nor the graph
    /// locked. The caller must have checked
    /// [`detect_deadlock`](Self::detect_deadlock) under the same lock.
    pub(super) fn block_on<G>(
        mut me: MutexGuard<'_, Self>,
        from_id: RuntimeId,
        database_key: DatabaseKeyIndex,
        to_id: RuntimeId,
        slot_guard: G,
        on_blocked: impl FnOnce(),
    ) -> WaitResult {
        let condvar = Arc::new(Condvar::new());
        me.edges.insert(
            from_id,
            Edge {
                blocked_on_id: to_id,
                blocked_on_key: database_key,
                condvar: condvar.clone(),
            },
        );
        me.query_dependents
            .entry(database_key)
            .or_default()
            .push(from_id);

        // The owner needs the slot lock to publish; it can only reach the
        // graph after we are registered.
        drop(slot_guard);
        // A wakeup during `on_blocked` leaves its result in `wait_results`.
        MutexGuard::unlocked(&mut me, on_blocked);

        loop {
            if let Some(result) = me.wait_results.remove(&from_id) {
                debug_assert!(!me.edges.contains_key(&from_id));
                return result;
            }
            condvar.wait(&mut me);
        }
    }

    /// Wake every runtime waiting for `database_key`.
    pub(super) fn unblock_runtimes_blocked_on(
        &mut self,
        database_key: DatabaseKeyIndex,
        result: WaitResult,
    ) {
        let dependents = self
            .query_dependents
            .remove(&database_key)
            .unwrap_or_default();
        for from_id in dependents {
            self.unblock_runtime(from_id, result.clone());
        }
    }

    fn unblock_runtime(&mut self, id: RuntimeId, result: WaitResult) {
        let Some(edge) = self.edges.remove(&id) else {
            tracing::warn!(?id, "runtime listed as dependent was not blocked");
            return;
        };
        self.wait_results.insert(id, result);
        edge.condvar.notify_one();
    }
}
