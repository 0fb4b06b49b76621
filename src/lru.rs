//! Least-recently-used tracking for derived values.
//!
//! Nodes live in a slab and are linked into a doubly linked list, most
//! recently used first. Each node remembers its own slab index, so promoting a
//! node is O(1) and evicting never touches the key indices other values use
//! in their dependency edges.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use slab::Slab;

/// Something that can be tracked by an [`Lru`].
pub(crate) trait LruNode: Send + Sync {
    fn lru_index(&self) -> &LruIndex;
}

const DETACHED: usize = usize::MAX;

/// Position of a node in its list. Only changed while the list is locked.
pub(crate) struct LruIndex {
    index: AtomicUsize,
}

impl Default for LruIndex {
    fn default() -> Self {
        Self {
            index: AtomicUsize::new(DETACHED),
        }
    }
}

impl LruIndex {
    fn load(&self) -> Option<usize> {
        match self.index.load(Ordering::Acquire) {
            DETACHED => None,
            index => Some(index),
        }
    }

    fn store(&self, index: Option<usize>) {
        self.index
            .store(index.unwrap_or(DETACHED), Ordering::Release);
    }
}

impl fmt::Debug for LruIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LruIndex({:?})", self.load())
    }
}

pub(crate) struct Lru<N: LruNode> {
    /// `0` disables tracking.
    capacity: AtomicUsize,
    list: Mutex<LruList<N>>,
}

struct LruList<N> {
    entries: Slab<LruEntry<N>>,
    head: Option<usize>,
    tail: Option<usize>,
}

struct LruEntry<N> {
    node: Arc<N>,
    prev: Option<usize>,
    next: Option<usize>,
}

impl<N: LruNode> Default for Lru<N> {
    fn default() -> Self {
        Self {
            capacity: AtomicUsize::new(0),
            list: Mutex::new(LruList {
                entries: Slab::new(),
                head: None,
                tail: None,
            }),
        }
    }
}

impl<N: LruNode> Lru<N> {
    pub(crate) fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Change the capacity, returning the nodes that no longer fit.
    pub(crate) fn set_capacity(&self, capacity: usize) -> Vec<Arc<N>> {
        let mut list = self.list.lock();
        self.capacity.store(capacity, Ordering::Relaxed);

        if capacity == 0 {
            list.clear();
            return Vec::new();
        }

        let mut evicted = Vec::new();
        while list.len() > capacity {
            match list.pop_back() {
                Some(node) => evicted.push(node),
                None => break,
            }
        }
        evicted
    }

    /// Mark `node` as most recently used, returning the node evicted to make
    /// room for it, if any.
    pub(crate) fn record_use(&self, node: &Arc<N>) -> Option<Arc<N>> {
        if self.capacity() == 0 {
            return None;
        }

        let mut list = self.list.lock();
        let capacity = self.capacity();
        if capacity == 0 {
            return None;
        }

        match node.lru_index().load() {
            Some(index) => {
                list.promote(index);
                None
            }
            None => {
                list.push_front(node.clone());
                if list.len() > capacity {
                    list.pop_back()
                } else {
                    None
                }
            }
        }
    }

    /// Forget every tracked node.
    pub(crate) fn purge(&self) {
        self.list.lock().clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.list.lock().len()
    }
}

impl<N: LruNode> LruList<N> {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = {
            let entry = &self.entries[index];
            (entry.prev, entry.next)
        };
        match prev {
            Some(prev) => self.entries[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.entries[next].prev = prev,
            None => self.tail = prev,
        }
    }

    fn link_front(&mut self, index: usize) {
        let old_head = self.head;
        {
            let entry = &mut self.entries[index];
            entry.prev = None;
            entry.next = old_head;
        }
        match old_head {
            Some(head) => self.entries[head].prev = Some(index),
            None => self.tail = Some(index),
        }
        self.head = Some(index);
    }

    fn promote(&mut self, index: usize) {
        if self.head != Some(index) {
            self.unlink(index);
            self.link_front(index);
        }
    }

    fn push_front(&mut self, node: Arc<N>) {
        let index = self.entries.insert(LruEntry {
            node: node.clone(),
            prev: None,
            next: None,
        });
        node.lru_index().store(Some(index));
        self.link_front(index);
    }

    fn pop_back(&mut self) -> Option<Arc<N>> {
        let tail = self.tail?;
        self.unlink(tail);
        let entry = self.entries.remove(tail);
        entry.node.lru_index().store(None);
        Some(entry.node)
    }

    fn clear(&mut self) {
        for entry in self.entries.drain() {
            entry.node.lru_index().store(None);
        }
        self.head = None;
        self.tail = None;
    }
}
