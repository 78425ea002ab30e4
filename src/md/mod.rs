//! # Metadata Entities
//!
//! In-memory representation of one directory ([`ContainerMd`]) and one file
//! ([`FileMd`]). Entities are plain data: they perform no I/O and know nothing
//! about the service that owns them.
//!
//! ## Change Journal
//!
//! Mutators that matter to observers (size changes, location moves, mtime
//! notifications, child-map edits) append an entry to a per-entity journal.
//! The owning service drains the journal when the entity is stored and turns
//! the entries into listener events or store operations. The journal is never
//! persisted and never takes part in equality.
//!
//! ## Sharing
//!
//! Services hand out [`FileMdPtr`] / [`ContainerMdPtr`] handles. The entity
//! lock is the per-entity synchronization point used by accounting walks.

mod container;
mod file;

use std::sync::Arc;

use parking_lot::RwLock;

pub use container::{ChildDelta, ContainerMd};
pub use file::FileMd;

/// Shared handle to a file entity owned by a file service.
pub type FileMdPtr = Arc<RwLock<FileMd>>;

/// Shared handle to a container entity owned by a container service.
pub type ContainerMdPtr = Arc<RwLock<ContainerMd>>;

/// Pending, not yet published changes of an entity.
#[derive(Debug, Clone)]
pub struct ChangeJournal<T> {
    entries: Vec<T>,
}

impl<T> ChangeJournal<T> {
    /// Append an entry.
    #[inline]
    pub fn record(&mut self, entry: T) {
        self.entries.push(entry);
    }

    /// Remove and return all entries in recording order.
    #[inline]
    pub fn drain(&mut self) -> Vec<T> {
        std::mem::take(&mut self.entries)
    }

    /// Pending entries, oldest first, left in place.
    #[inline]
    pub fn pending(&self) -> &[T] {
        &self.entries
    }

    /// Number of pending entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing is pending.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for ChangeJournal<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

// Pending changes are transient bookkeeping, not entity state.
impl<T> PartialEq for ChangeJournal<T> {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl<T> Eq for ChangeJournal<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn journal_drains_in_order() {
        let mut journal = ChangeJournal::default();
        journal.record(1);
        journal.record(2);
        assert_eq!(journal.len(), 2);
        assert_eq!(journal.pending(), &[1, 2]);
        assert_eq!(journal.drain(), vec![1, 2]);
        assert!(journal.is_empty());
    }

    #[test]
    fn journal_is_ignored_by_equality() {
        let mut a = ChangeJournal::default();
        a.record("x");
        let b = ChangeJournal::<&str>::default();
        assert_eq!(a, b);
    }
}
