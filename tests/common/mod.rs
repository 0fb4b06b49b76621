//! A host database shared by the integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Barrier};

use memoflow::{
    Database, Event, EventKind, ParallelDatabase, Snapshot, Storage, StorageBuilder,
};
use parking_lot::Mutex;

/// Called for every event, after it has been recorded.
pub type Observer = Arc<dyn Fn(&TestDb, &Event) + Send + Sync>;

pub struct TestDb {
    storage: Storage<Self>,
    log: Arc<Mutex<Vec<String>>>,
    events: Arc<Mutex<Vec<Event>>>,
    barrier: Arc<Barrier>,
    observer: Option<Observer>,
}

impl TestDb {
    pub fn new(register: impl FnOnce(StorageBuilder<Self>) -> StorageBuilder<Self>) -> Self {
        Self {
            storage: register(Storage::builder()).build(),
            log: Arc::default(),
            events: Arc::default(),
            barrier: Arc::new(Barrier::new(2)),
            observer: None,
        }
    }

    pub fn with_observer(
        register: impl FnOnce(StorageBuilder<Self>) -> StorageBuilder<Self>,
        observer: impl Fn(&TestDb, &Event) + Send + Sync + 'static,
    ) -> Self {
        Self {
            observer: Some(Arc::new(observer)),
            ..Self::new(register)
        }
    }

    /// Record that something happened, usually a query body running.
    pub fn log(&self, entry: impl Into<String>) {
        self.log.lock().push(entry.into());
    }

    /// Everything logged since the last call.
    pub fn take_log(&self) -> Vec<String> {
        std::mem::take(&mut *self.log.lock())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    pub fn has_event(&self, matches: impl Fn(&EventKind) -> bool) -> bool {
        self.events.lock().iter().any(|event| matches(&event.kind))
    }

    /// Keys rendered as `name(key)` for every event of the given kind.
    pub fn event_keys(&self, select: impl Fn(&EventKind) -> bool) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|event| select(&event.kind))
            .filter_map(|event| match event.kind {
                EventKind::DidValidateMemoizedValue { database_key }
                | EventKind::WillExecute { database_key }
                | EventKind::WillBlockOn { database_key, .. } => {
                    Some(format!("{:?}", database_key.debug(self)))
                }
                EventKind::WillCheckCancellation => None,
            })
            .collect()
    }

    pub fn executed(&self) -> Vec<String> {
        self.event_keys(|kind| matches!(kind, EventKind::WillExecute { .. }))
    }

    pub fn validated(&self) -> Vec<String> {
        self.event_keys(|kind| matches!(kind, EventKind::DidValidateMemoizedValue { .. }))
    }

    /// Rendezvous with one other thread sharing this database.
    pub fn wait_barrier(&self) {
        self.barrier.wait();
    }

    /// Spin until some runtime reported that it is about to block.
    pub fn wait_for_blocked_runtime(&self) {
        while !self.has_event(|kind| matches!(kind, EventKind::WillBlockOn { .. })) {
            std::thread::yield_now();
        }
    }
}

impl Database for TestDb {
    fn storage(&self) -> &Storage<Self> {
        &self.storage
    }

    fn storage_mut(&mut self) -> &mut Storage<Self> {
        &mut self.storage
    }

    fn on_event(&self, event: Event) {
        self.events.lock().push(event);
        if let Some(observer) = &self.observer {
            observer(self, &event);
        }
    }
}

impl ParallelDatabase for TestDb {
    fn snapshot(&self) -> Snapshot<Self> {
        Snapshot::new(TestDb {
            storage: self.storage.snapshot(),
            log: self.log.clone(),
            events: self.events.clone(),
            barrier: self.barrier.clone(),
            observer: self.observer.clone(),
        })
    }
}
