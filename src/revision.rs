//! Revision and Durability types.
//!
//! A [`Revision`] identifies one version of all inputs. Every committed write
//! moves the database to a strictly greater revision. A [`Durability`] says how
//! often an input is expected to change; the runtime keeps one "last changed"
//! counter per durability level so that values built only from stable inputs
//! can be re-validated without walking their dependencies.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A unique identifier for the current version of the database.
///
/// Revisions start at 1 and strictly increase on every input write. Read-only
/// operations never change the revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Revision(u64);

impl Revision {
    /// The revision of a freshly created database.
    pub const START: Revision = Revision(1);

    /// Get the numeric value of this revision.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub(crate) fn next(self) -> Revision {
        Revision(self.0 + 1)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}

/// Describes how likely a value is to change.
///
/// Ordered `LOW < MEDIUM < HIGH`. A derived value's durability is the minimum
/// durability of everything it read: the least stable input bounds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Durability(u8);

impl Durability {
    /// Things that change frequently, e.g. the source file being edited.
    pub const LOW: Durability = Durability(0);

    /// Things that change sometimes, e.g. project configuration.
    pub const MEDIUM: Durability = Durability(1);

    /// Things that are not expected to change, e.g. the standard library.
    pub const HIGH: Durability = Durability(2);

    /// The most stable durability. A query that reads nothing has this durability.
    pub const MAX: Durability = Self::HIGH;

    /// Number of durability levels.
    pub(crate) const LEN: usize = 3;

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    /// Get the minimum of two durability levels.
    #[inline]
    pub fn min(self, other: Self) -> Self {
        if self.0 <= other.0 {
            self
        } else {
            other
        }
    }
}

impl Default for Durability {
    fn default() -> Self {
        Durability::LOW
    }
}

/// An atomically updated revision, used for the pending-write flag.
pub(crate) struct AtomicRevision {
    data: AtomicU64,
}

impl AtomicRevision {
    pub(crate) const fn start() -> Self {
        Self {
            data: AtomicU64::new(Revision::START.0),
        }
    }

    pub(crate) fn load(&self) -> Revision {
        Revision(self.data.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, revision: Revision) {
        self.data.store(revision.0, Ordering::Release);
    }
}

/// Per-durability "last changed" revisions.
///
/// `counters[d]` is the last revision in which an input of durability `d` or
/// higher changed. When an input at durability `D` changes, every level
/// `0..=D` is moved to the new revision. Level 0 (`LOW`) therefore always holds
/// the current revision.
pub(crate) struct DurabilityRevisions {
    counters: [AtomicRevision; Durability::LEN],
}

impl Default for DurabilityRevisions {
    fn default() -> Self {
        Self::new()
    }
}

impl DurabilityRevisions {
    pub(crate) fn new() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicRevision::start()),
        }
    }

    /// The current revision of the database.
    #[inline]
    pub(crate) fn current(&self) -> Revision {
        self.counters[Durability::LOW.index()].load()
    }

    /// Last revision in which an input of at least durability `d` changed.
    #[inline]
    pub(crate) fn last_changed(&self, d: Durability) -> Revision {
        self.counters[d.index()].load()
    }

    /// Move levels `0..=d` to `revision`. Level 0 always moves.
    ///
    /// Higher levels are stored first so that a reader that observes the new
    /// current revision never observes a stale higher level.
    pub(crate) fn advance(&self, revision: Revision, d: Option<Durability>) {
        if let Some(d) = d {
            for level in (1..=d.index()).rev() {
                self.counters[level].store(revision);
            }
        }
        self.counters[Durability::LOW.index()].store(revision);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_durability_order() {
        assert!(Durability::LOW < Durability::MEDIUM);
        assert!(Durability::MEDIUM < Durability::HIGH);
        assert_eq!(Durability::MAX, Durability::HIGH);
    }

    #[test]
    fn test_durability_min() {
        assert_eq!(Durability::LOW.min(Durability::HIGH), Durability::LOW);
        assert_eq!(Durability::HIGH.min(Durability::MEDIUM), Durability::MEDIUM);
        assert_eq!(Durability::MEDIUM.min(Durability::MEDIUM), Durability::MEDIUM);
    }

    #[test]
    fn test_revision_next() {
        let r = Revision::START;
        assert_eq!(r.as_u64(), 1);
        assert!(r.next() > r);
        assert_eq!(r.next().to_string(), "R2");
    }

    #[test]
    fn test_advance_low_only() {
        let revisions = DurabilityRevisions::new();
        let r2 = Revision::START.next();
        revisions.advance(r2, None);

        assert_eq!(revisions.current(), r2);
        assert_eq!(revisions.last_changed(Durability::LOW), r2);
        assert_eq!(revisions.last_changed(Durability::MEDIUM), Revision::START);
        assert_eq!(revisions.last_changed(Durability::HIGH), Revision::START);
    }

    #[test]
    fn test_advance_high_moves_all_levels() {
        let revisions = DurabilityRevisions::new();
        let r2 = Revision::START.next();
        revisions.advance(r2, Some(Durability::MEDIUM));
        let r3 = r2.next();
        revisions.advance(r3, Some(Durability::HIGH));

        assert_eq!(revisions.current(), r3);
        assert_eq!(revisions.last_changed(Durability::MEDIUM), r3);
        assert_eq!(revisions.last_changed(Durability::HIGH), r3);
    }
}
