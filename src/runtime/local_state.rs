//! The stack of queries a single handle is executing.

use std::cell::RefCell;

use indexmap::IndexSet;

use crate::error::QueryError;
use crate::key::DatabaseKeyIndex;
use crate::revision::Durability;

/// Per-handle state: the stack of queries this runtime is executing.
///
/// Only touched from the thread that owns the handle.
#[derive(Default)]
pub(super) struct LocalState {
    query_stack: RefCell<Vec<ActiveQuery>>,
}

/// One frame of the active-query stack.
pub(super) struct ActiveQuery {
    pub(super) database_key_index: DatabaseKeyIndex,

    /// Minimum durability of everything read so far.
    pub(super) durability: Durability,

    /// Every key read so far, in first-read order. `None` once an untracked
    /// read happened.
    pub(super) dependencies: Option<IndexSet<DatabaseKeyIndex, ahash::RandomState>>,

    /// The first failure observed by a nested read.
    pub(super) poison: Option<QueryError>,
}

impl ActiveQuery {
    fn new(database_key_index: DatabaseKeyIndex) -> Self {
        Self {
            database_key_index,
            durability: Durability::MAX,
            dependencies: Some(IndexSet::with_hasher(ahash::RandomState::new())),
            poison: None,
        }
    }

    fn add_read(&mut self, input: DatabaseKeyIndex, durability: Durability) {
        if let Some(dependencies) = &mut self.dependencies {
            dependencies.insert(input);
        }
        self.durability = self.durability.min(durability);
    }

    fn add_untracked_read(&mut self) {
        self.dependencies = None;
        self.durability = Durability::LOW;
    }

    fn add_synthetic_read(&mut self, durability: Durability) {
        self.durability = self.durability.min(durability);
    }

    fn poison(&mut self, error: &QueryError) {
        if self.poison.is_none() {
            self.poison = Some(error.clone());
        }
    }
}

impl LocalState {
    pub(super) fn push_query(&self, database_key_index: DatabaseKeyIndex) -> ActiveQueryGuard<'_> {
        let mut query_stack = self.query_stack.borrow_mut();
        let push_len = query_stack.len();
        query_stack.push(ActiveQuery::new(database_key_index));
        ActiveQueryGuard {
            local_state: self,
            push_len,
        }
    }

    pub(super) fn query_in_progress(&self) -> bool {
        !self.query_stack.borrow().is_empty()
    }

    pub(super) fn active_query(&self) -> Option<DatabaseKeyIndex> {
        self.query_stack
            .borrow()
            .last()
            .map(|query| query.database_key_index)
    }

    pub(super) fn report_query_read(&self, input: DatabaseKeyIndex, durability: Durability) {
        if let Some(top) = self.query_stack.borrow_mut().last_mut() {
            top.add_read(input, durability);
        }
    }

    pub(super) fn report_untracked_read(&self) {
        if let Some(top) = self.query_stack.borrow_mut().last_mut() {
            top.add_untracked_read();
        }
    }

    pub(super) fn report_synthetic_read(&self, durability: Durability) {
        if let Some(top) = self.query_stack.borrow_mut().last_mut() {
            top.add_synthetic_read(durability);
        }
    }

    /// Poison the innermost frame with `error`. A failed read of `input` is
    /// still a dependency: the memo (if recovery stores one) must be
    /// revalidated against it.
    pub(super) fn report_failure(&self, input: Option<DatabaseKeyIndex>, error: &QueryError) {
        if let Some(top) = self.query_stack.borrow_mut().last_mut() {
            if let Some(input) = input {
                top.add_read(input, Durability::LOW);
            }
            top.poison(error);
        }
    }

    /// Keys from the frame executing `database_key` up to the innermost frame.
    pub(super) fn cycle_participants(
        &self,
        database_key: DatabaseKeyIndex,
    ) -> Option<Vec<DatabaseKeyIndex>> {
        let query_stack = self.query_stack.borrow();
        let start = query_stack
            .iter()
            .position(|query| query.database_key_index == database_key)?;
        Some(
            query_stack[start..]
                .iter()
                .map(|query| query.database_key_index)
                .collect(),
        )
    }
}

/// Pops the frame it pushed, even if the query function panics.
pub(super) struct ActiveQueryGuard<'me> {
    local_state: &'me LocalState,
    push_len: usize,
}

impl ActiveQueryGuard<'_> {
    /// Pop the frame and return what it recorded.
    pub(super) fn complete(self) -> ActiveQuery {
        let mut query_stack = self.local_state.query_stack.borrow_mut();
        assert_eq!(
            query_stack.len(),
            self.push_len + 1,
            "active query stack is unbalanced"
        );
        match query_stack.pop() {
            Some(query) => query,
            None => unreachable!("stack length was checked above"),
        }
    }
}

impl Drop for ActiveQueryGuard<'_> {
    fn drop(&mut self) {
        // No-op after `complete`; on unwind, discards the frame.
        self.local_state.query_stack.borrow_mut().truncate(self.push_len);
    }
}
