//! The memoization cell behind one key of a derived query.
//!
//! A slot holds a memo, or is in progress on exactly one runtime while that
//! runtime computes it. Reading claims the slot, validates the old memo against its
//! recorded inputs and re-executes only when one of them changed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::database::Database;
use crate::error::{Cancelled, QueryError, QueryResult};
use crate::event::{Event, EventKind};
use crate::key::DatabaseKeyIndex;
use crate::lru::{LruIndex, LruNode};
use crate::query::{Query, QueryFunction};
use crate::revision::{Durability, Revision};
use crate::runtime::{QueryInputs, QueryRevisions, Runtime, RuntimeId, WaitResult};
use crate::storage::{StampedValue, TableEntry};

/// The memoization cell for one key of a derived query.
pub(super) struct Slot<Q: Query> {
    key: Q::Key,
    database_key_index: DatabaseKeyIndex,
    state: RwLock<QueryState<Q::Value>>,
    lru_index: LruIndex,
}

enum QueryState<V> {
    NotComputed,

    /// A runtime is computing or validating the value. Other runtimes block
    /// until it is done.
    InProgress {
        id: RuntimeId,
        anyone_waiting: AtomicBool,
    },

    Memoized(Memo<V>),
}

impl<V> QueryState<V> {
    fn in_progress(id: RuntimeId) -> Self {
        QueryState::InProgress {
            id,
            anyone_waiting: AtomicBool::new(false),
        }
    }
}

struct Memo<V> {
    /// `None` once evicted; the revision data is kept so the memo can still
    /// answer `maybe_changed_after`.
    value: Option<Arc<V>>,

    /// Last revision in which the value was confirmed up to date.
    verified_at: Revision,

    /// Last revision in which the value actually changed.
    changed_at: Revision,

    revisions: QueryRevisions,
}

impl<V> Memo<V> {
    fn stamped(&self, value: Arc<V>) -> StampedValue<V> {
        StampedValue {
            value,
            durability: self.revisions.durability,
            changed_at: self.changed_at,
        }
    }

    /// Returns true if the memo is up to date in `revision_now`, marking it
    /// verified. Dependency errors other than cancellation count as changes.
    fn validate<DB: Database>(&mut self, db: &DB, revision_now: Revision) -> QueryResult<bool> {
        if self.verified_at == revision_now {
            return Ok(true);
        }

        // Nothing at this durability changed since the last verification.
        let last_changed = db.runtime().last_changed_revision(self.revisions.durability);
        if last_changed <= self.verified_at {
            tracing::trace!(
                verified_at = %self.verified_at,
                %last_changed,
                durability = ?self.revisions.durability,
                "validated by durability"
            );
            self.verified_at = revision_now;
            return Ok(true);
        }

        let inputs = match &self.revisions.inputs {
            QueryInputs::Tracked(inputs) => inputs.clone(),
            QueryInputs::Untracked => return Ok(false),
        };
        for &input in inputs.iter() {
            match db
                .storage()
                .tables()
                .maybe_changed_after(db, input, self.verified_at)
            {
                Ok(false) => {}
                Ok(true) => {
                    tracing::trace!(input = ?input.debug(db), "input changed");
                    return Ok(false);
                }
                Err(QueryError::Cancelled(cancelled)) => return Err(cancelled.into()),
                Err(error) => {
                    tracing::debug!(input = ?input.debug(db), %error, "input failed to validate");
                    return Ok(false);
                }
            }
        }

        self.verified_at = revision_now;
        Ok(true)
    }
}

/// Outcome of claiming a slot for this runtime.
enum Claim<R, V> {
    /// The memo was already verified in this revision.
    UpToDate(R),
    /// The slot is now in progress for us; holds the previous memo, if any.
    Claimed(Option<Memo<V>>),
}

impl<Q: Query> LruNode for Slot<Q> {
    fn lru_index(&self) -> &LruIndex {
        &self.lru_index
    }
}

impl<Q: Query> Slot<Q> {
    pub(super) fn new(key: Q::Key, database_key_index: DatabaseKeyIndex) -> Self {
        Self {
            key,
            database_key_index,
            state: RwLock::new(QueryState::NotComputed),
            lru_index: LruIndex::default(),
        }
    }

    pub(super) fn database_key_index(&self) -> DatabaseKeyIndex {
        self.database_key_index
    }

    /// Read the value, computing or validating it if it is not verified in the
    /// current revision.
    pub(super) fn read<DB>(&self, db: &DB) -> QueryResult<StampedValue<Q::Value>>
    where
        DB: Database,
        Q: QueryFunction<DB>,
    {
        let runtime = db.runtime();
        let revision_now = runtime.current_revision();

        // Fast path under the shared lock.
        loop {
            let state = self.state.read();
            match &*state {
                QueryState::Memoized(memo) if memo.verified_at == revision_now => {
                    if let Some(value) = &memo.value {
                        tracing::trace!(
                            database_key = ?self.database_key_index.debug(db),
                            changed_at = %memo.changed_at,
                            "memoized value is up to date"
                        );
                        return Ok(memo.stamped(value.clone()));
                    }
                    break;
                }
                QueryState::InProgress { id, anyone_waiting } => {
                    let other_id = *id;
                    if other_id == runtime.id() {
                        return Err(runtime.cycle_error(db, self.database_key_index));
                    }
                    anyone_waiting.store(true, Ordering::Relaxed);
                    runtime.block_on(db, self.database_key_index, other_id, state)?;
                }
                QueryState::NotComputed | QueryState::Memoized(_) => break,
            }
        }

        self.read_upgrade(db, revision_now)
    }

    fn read_upgrade<DB>(&self, db: &DB, revision_now: Revision) -> QueryResult<StampedValue<Q::Value>>
    where
        DB: Database,
        Q: QueryFunction<DB>,
    {
        let runtime = db.runtime();
        let up_to_date = |memo: &Memo<Q::Value>| memo.value.clone().map(|value| memo.stamped(value));
        let mut old_memo = match self.claim(db, revision_now, up_to_date)? {
            Claim::UpToDate(stamped) => return Ok(stamped),
            Claim::Claimed(old_memo) => old_memo,
        };
        let panic_guard = PanicGuard::new(self, runtime);

        let mut validated = false;
        if let Some(memo) = old_memo.as_mut() {
            validated = match self.validate_memo(db, revision_now, memo) {
                Ok(validated) => validated,
                Err(error) => return Err(panic_guard.fail(old_memo, error)),
            };
            if validated {
                if let Some(value) = memo.value.clone() {
                    let stamped = memo.stamped(value);
                    panic_guard.proceed(old_memo);
                    return Ok(stamped);
                }
            }
        }

        match self.execute(db, revision_now, old_memo.as_ref(), validated) {
            Ok((memo, stamped)) => {
                panic_guard.proceed(Some(memo));
                Ok(stamped)
            }
            Err(error) => Err(panic_guard.fail(old_memo, error)),
        }
    }

    /// Returns true if the value changed after `revision`.
    ///
    /// Validates the memo, and re-executes the query when its inputs changed
    /// so that an equal result still counts as unchanged.
    pub(super) fn maybe_changed_after<DB>(&self, db: &DB, revision: Revision) -> QueryResult<bool>
    where
        DB: Database,
        Q: QueryFunction<DB>,
    {
        let runtime = db.runtime();
        let revision_now = runtime.current_revision();

        loop {
            let state = self.state.read();
            match &*state {
                QueryState::NotComputed => return Ok(true),
                QueryState::Memoized(memo) if memo.verified_at == revision_now => {
                    return Ok(memo.changed_at > revision)
                }
                QueryState::Memoized(_) => break,
                QueryState::InProgress { id, anyone_waiting } => {
                    let other_id = *id;
                    if other_id == runtime.id() {
                        // Re-entered while validating a cycle. Reporting a
                        // change makes the caller re-execute and hit the cycle
                        // on a real read.
                        tracing::debug!(
                            database_key = ?self.database_key_index.debug(db),
                            "cycle during validation"
                        );
                        return Ok(true);
                    }
                    anyone_waiting.store(true, Ordering::Relaxed);
                    runtime.block_on(db, self.database_key_index, other_id, state)?;
                }
            }
        }

        let mut old_memo = match self.claim(db, revision_now, |memo| Some(memo.changed_at))? {
            Claim::UpToDate(changed_at) => return Ok(changed_at > revision),
            Claim::Claimed(old_memo) => old_memo,
        };
        let panic_guard = PanicGuard::new(self, runtime);

        let Some(memo) = old_memo.as_mut() else {
            // Swept while we were waiting for the lock.
            panic_guard.proceed(None);
            return Ok(true);
        };
        let validated = match self.validate_memo(db, revision_now, memo) {
            Ok(validated) => validated,
            Err(error) => return Err(panic_guard.fail(old_memo, error)),
        };
        if validated {
            let changed = memo.changed_at > revision;
            panic_guard.proceed(old_memo);
            return Ok(changed);
        }
        if memo.value.is_none() {
            // Evicted: there is nothing to compare a new value against.
            panic_guard.proceed(old_memo);
            return Ok(true);
        }

        match self.execute(db, revision_now, old_memo.as_ref(), false) {
            Ok((memo, _)) => {
                let changed = memo.changed_at > revision;
                panic_guard.proceed(Some(memo));
                Ok(changed)
            }
            Err(error) => Err(panic_guard.fail(old_memo, error)),
        }
    }

    /// Take the slot for this runtime, blocking while another runtime holds it.
    ///
    /// A memo verified in this revision is returned through `up_to_date`
    /// instead, unless it returns `None`.
    fn claim<DB, R>(
        &self,
        db: &DB,
        revision_now: Revision,
        up_to_date: impl Fn(&Memo<Q::Value>) -> Option<R>,
    ) -> QueryResult<Claim<R, Q::Value>>
    where
        DB: Database,
    {
        let runtime = db.runtime();
        loop {
            let mut state = self.state.write();
            match &*state {
                QueryState::Memoized(memo) if memo.verified_at == revision_now => {
                    if let Some(result) = up_to_date(memo) {
                        return Ok(Claim::UpToDate(result));
                    }
                }
                QueryState::InProgress { id, anyone_waiting } => {
                    let other_id = *id;
                    if other_id == runtime.id() {
                        return Err(runtime.cycle_error(db, self.database_key_index));
                    }
                    anyone_waiting.store(true, Ordering::Relaxed);
                    runtime.block_on(db, self.database_key_index, other_id, state)?;
                    continue;
                }
                QueryState::NotComputed | QueryState::Memoized(_) => {}
            }

            return match std::mem::replace(&mut *state, QueryState::in_progress(runtime.id())) {
                QueryState::Memoized(memo) => Ok(Claim::Claimed(Some(memo))),
                QueryState::NotComputed => Ok(Claim::Claimed(None)),
                QueryState::InProgress { .. } => unreachable!("in-progress slots are handled above"),
            };
        }
    }

    fn validate_memo<DB: Database>(
        &self,
        db: &DB,
        revision_now: Revision,
        memo: &mut Memo<Q::Value>,
    ) -> QueryResult<bool> {
        let validated = memo.validate(db, revision_now)?;
        if validated {
            tracing::trace!(
                database_key = ?self.database_key_index.debug(db),
                "validated memoized value"
            );
            db.on_event(Event {
                runtime_id: db.runtime().id(),
                kind: EventKind::DidValidateMemoizedValue {
                    database_key: self.database_key_index,
                },
            });
        }
        Ok(validated)
    }

    /// Run the query function and build the new memo.
    ///
    /// `validated` means the old memo was confirmed up to date but had lost
    /// its value; the new value is then the same and keeps the old change
    /// revision.
    fn execute<DB>(
        &self,
        db: &DB,
        revision_now: Revision,
        old_memo: Option<&Memo<Q::Value>>,
        validated: bool,
    ) -> QueryResult<(Memo<Q::Value>, StampedValue<Q::Value>)>
    where
        DB: Database,
        Q: QueryFunction<DB>,
    {
        let runtime = db.runtime();
        let key = &self.key;
        let result =
            runtime.execute_query_implementation(db, self.database_key_index, || Q::execute(db, key));
        let revisions = result.revisions;

        let value = match result.value {
            Ok(value) => value,
            Err(QueryError::Cycle(cycle)) if cycle.contains(self.database_key_index) => {
                match Q::recover(db, &cycle, key) {
                    Some(value) => {
                        tracing::debug!(
                            database_key = ?self.database_key_index.debug(db),
                            %cycle,
                            "recovered from cycle"
                        );
                        value
                    }
                    None => return Err(QueryError::Cycle(cycle)),
                }
            }
            Err(error) => return Err(error),
        };

        let mut changed_at = revision_now;
        if let Some(old_memo) = old_memo {
            if validated {
                changed_at = old_memo.changed_at;
            } else if let Some(old_value) = &old_memo.value {
                // A less durable value must not inherit the old change
                // revision: durability validation would skip it.
                if revisions.durability >= old_memo.revisions.durability
                    && Q::value_eq(old_value, &value)
                {
                    tracing::debug!(
                        database_key = ?self.database_key_index.debug(db),
                        changed_at = %old_memo.changed_at,
                        "value unchanged, backdating"
                    );
                    changed_at = old_memo.changed_at;
                }
            }
        }

        let value = Arc::new(value);
        let memo = Memo {
            value: Some(value.clone()),
            verified_at: revision_now,
            changed_at,
            revisions,
        };
        let stamped = memo.stamped(value);
        Ok((memo, stamped))
    }

    /// Returns true if the memo holds a value that [`evict`](Self::evict)
    /// would drop.
    pub(super) fn is_evictable(&self) -> bool {
        match &*self.state.read() {
            QueryState::Memoized(memo) => {
                memo.value.is_some() && matches!(memo.revisions.inputs, QueryInputs::Tracked(_))
            }
            QueryState::NotComputed | QueryState::InProgress { .. } => false,
        }
    }

    /// Drop the value but keep the revision data. Untracked memos keep their
    /// value: they could not be revalidated without it.
    pub(super) fn evict(&self) {
        let mut state = self.state.write();
        if let QueryState::Memoized(memo) = &mut *state {
            if let QueryInputs::Tracked(_) = memo.revisions.inputs {
                tracing::trace!(database_key = ?self.database_key_index, "evicting value");
                memo.value = None;
            }
        }
    }

    /// Mark the memo as changed in `new_revision` and force re-execution.
    pub(super) fn invalidate(&self, new_revision: Revision) -> Option<Durability> {
        let mut state = self.state.write();
        match &mut *state {
            QueryState::Memoized(memo) => {
                memo.revisions.inputs = QueryInputs::Untracked;
                memo.changed_at = new_revision;
                Some(memo.revisions.durability)
            }
            QueryState::NotComputed | QueryState::InProgress { .. } => None,
        }
    }

    /// Forget the memo.
    pub(super) fn reset(&self) {
        let mut state = self.state.write();
        if let QueryState::Memoized(_) = &*state {
            *state = QueryState::NotComputed;
        }
    }

    pub(super) fn as_table_entry(&self) -> TableEntry<Q::Key, Q::Value> {
        let value = match &*self.state.read() {
            QueryState::Memoized(memo) => memo.value.clone(),
            QueryState::NotComputed | QueryState::InProgress { .. } => None,
        };
        TableEntry::new(self.key.clone(), value)
    }

    pub(super) fn durability(&self) -> Option<Durability> {
        match &*self.state.read() {
            QueryState::Memoized(memo) => Some(memo.revisions.durability),
            QueryState::NotComputed | QueryState::InProgress { .. } => None,
        }
    }
}

/// Releases a claimed slot.
///
/// Publishing or failing consumes the guard; if it is dropped instead (the
/// query function panicked), the slot goes back to `NotComputed` and waiting
/// runtimes are cancelled.
struct PanicGuard<'me, Q: Query> {
    slot: &'me Slot<Q>,
    runtime: &'me Runtime,
    released: bool,
}

impl<'me, Q: Query> PanicGuard<'me, Q> {
    fn new(slot: &'me Slot<Q>, runtime: &'me Runtime) -> Self {
        Self {
            slot,
            runtime,
            released: false,
        }
    }

    /// Store `memo` and wake waiters to read it.
    fn proceed(mut self, memo: Option<Memo<Q::Value>>) {
        self.overwrite_placeholder(memo, WaitResult::Completed);
    }

    /// Put back `old_memo` and hand `error` to waiters.
    ///
    /// Waiters retry after a cycle error: the cycle belongs to this runtime's
    /// stack, and may not exist from theirs.
    fn fail(mut self, old_memo: Option<Memo<Q::Value>>, error: QueryError) -> QueryError {
        let wait_result = match &error {
            QueryError::Cycle(_) => WaitResult::Completed,
            QueryError::Cancelled(_) | QueryError::Deadlock(_) => WaitResult::Failed(error.clone()),
        };
        self.overwrite_placeholder(old_memo, wait_result);
        error
    }

    fn overwrite_placeholder(&mut self, memo: Option<Memo<Q::Value>>, wait_result: WaitResult) {
        self.released = true;
        let new_state = match memo {
            Some(memo) => QueryState::Memoized(memo),
            None => QueryState::NotComputed,
        };
        let old_state = std::mem::replace(&mut *self.slot.state.write(), new_state);

        match old_state {
            QueryState::InProgress { id, anyone_waiting } => {
                debug_assert_eq!(id, self.runtime.id());
                if anyone_waiting.into_inner() {
                    self.runtime
                        .unblock_queries_blocked_on(self.slot.database_key_index, wait_result);
                }
            }
            QueryState::NotComputed | QueryState::Memoized(_) => {
                tracing::error!(
                    database_key = ?self.slot.database_key_index,
                    "released a slot that was not in progress"
                );
            }
        }
    }
}

impl<Q: Query> Drop for PanicGuard<'_, Q> {
    fn drop(&mut self) {
        if !self.released {
            tracing::debug!(
                database_key = ?self.slot.database_key_index,
                "query function panicked, releasing slot"
            );
            self.overwrite_placeholder(
                None,
                WaitResult::Failed(Cancelled::PropagatedPanic.into()),
            );
        }
    }
}
