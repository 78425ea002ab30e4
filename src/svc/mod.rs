//! # Service Backends
//!
//! | Backend | Module | Persistence |
//! |---------|--------|-------------|
//! | [`InMemoryContainerMdSvc`] / [`InMemoryFileMdSvc`] | `memory` | optional [`Changelog`] |
//! | [`KvContainerMdSvc`] / [`KvFileMdSvc`] | `kv` | any [`KvStore`] ([`MemoryKvStore`], [`SqliteKvStore`]) |
//!
//! All backends follow the same rules: operations before `initialize` fail
//! with [`NsError::InvalidState`](crate::NsError::InvalidState), events are
//! dispatched after every entity lock has been released, and erasing an id
//! that is already gone succeeds.

pub mod changelog;
mod kv;
mod memory;

use std::sync::atomic::{AtomicBool, Ordering};

pub use changelog::{Changelog, LogRecord};
pub use kv::{KvContainerMdSvc, KvFileMdSvc, KvOp, KvStore, MemoryKvStore, SqliteKvStore};
pub use memory::{InMemoryContainerMdSvc, InMemoryFileMdSvc};

use crate::md::{ContainerMd, FileMd};
use crate::traits::{ContainerChange, ContainerMdEvent, FileChange, FileMdEvent};
use crate::NsError;

/// Initialized flag shared by every backend.
#[derive(Debug, Default)]
pub(crate) struct Lifecycle {
    initialized: AtomicBool,
}

impl Lifecycle {
    pub(crate) fn ensure(&self, operation: &'static str) -> Result<(), NsError> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(NsError::uninitialized(operation))
        }
    }

    pub(crate) fn ensure_not(&self, operation: &'static str) -> Result<(), NsError> {
        if self.initialized.load(Ordering::Acquire) {
            Err(NsError::InvalidState {
                operation,
                reason: "service is already initialized".into(),
            })
        } else {
            Ok(())
        }
    }

    pub(crate) fn set(&self, initialized: bool) {
        self.initialized.store(initialized, Ordering::Release);
    }
}

/// Drain a file's journal into the events `update_store` publishes.
pub(crate) fn file_events(file: &mut FileMd) -> Vec<FileMdEvent> {
    let (id, container_id) = (file.id(), file.container_id());
    file.take_changes()
        .into_iter()
        .chain(std::iter::once(FileChange::Updated))
        .map(|change| FileMdEvent::new(id, container_id, change))
        .collect()
}

/// Drain a container's journal into the events `update_store` publishes.
pub(crate) fn container_events(container: &mut ContainerMd) -> Vec<ContainerMdEvent> {
    let (id, parent_id) = (container.id(), container.parent_id());
    container
        .take_changes()
        .into_iter()
        .chain(std::iter::once(ContainerChange::Updated))
        .map(|change| ContainerMdEvent::new(id, parent_id, change))
        .collect()
}

/// Refuse to erase a file that still has replicas.
pub(crate) fn check_file_removable(file: &FileMd) -> Result<(), NsError> {
    if file.num_locations() > 0 || file.num_unlinked_locations() > 0 {
        return Err(NsError::InvalidState {
            operation: "remove_file",
            reason: format!(
                "file #{} still has {} valid and {} unlinked replicas",
                file.id(),
                file.num_locations(),
                file.num_unlinked_locations()
            ),
        });
    }
    Ok(())
}

/// Refuse to erase a container that still has children.
pub(crate) fn check_container_removable(container: &ContainerMd) -> Result<(), NsError> {
    if !container.is_empty() {
        return Err(NsError::InvalidState {
            operation: "remove_container",
            reason: format!(
                "container #{} still has {} subcontainers and {} files",
                container.id(),
                container.num_containers(),
                container.num_files()
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_gates_operations() {
        let state = Lifecycle::default();
        assert!(matches!(state.ensure("get"), Err(NsError::InvalidState { .. })));
        assert!(state.ensure_not("configure").is_ok());
        state.set(true);
        assert!(state.ensure("get").is_ok());
        assert!(state.ensure_not("configure").is_err());
    }

    #[test]
    fn journal_becomes_events_followed_by_updated() {
        let mut file = FileMd::new(7);
        file.set_container_id(3);
        file.set_size(10);
        file.add_location(2);
        let events = file_events(&mut file);
        let changes: Vec<_> = events.iter().map(|e| e.change).collect();
        assert_eq!(
            changes,
            vec![
                FileChange::SizeChange(10),
                FileChange::LocationAdded(2),
                FileChange::Updated
            ]
        );
        assert!(events.iter().all(|e| e.file_id == 7 && e.container_id == 3));
        assert_eq!(file.pending_changes(), 0);
    }

    #[test]
    fn replicas_block_removal() {
        let mut file = FileMd::new(1);
        file.add_location(5);
        assert!(check_file_removable(&file).is_err());
        file.unlink_location(5);
        assert!(check_file_removable(&file).is_err());
        file.remove_location(5);
        assert!(check_file_removable(&file).is_ok());
    }
}
