//! # Metadata Service Traits
//!
//! The persistence contract every backend implements, and the observer
//! contract used by accounting and any other subsystem that follows
//! namespace mutations.
//!
//! ## Services
//!
//! | Trait | Owns |
//! |-------|------|
//! | [`ContainerMdSvc`] | container ids, records and listeners |
//! | [`FileMdSvc`] | file ids, records and listeners |
//!
//! Backends are interchangeable and selected at startup:
//!
//! - [`InMemoryContainerMdSvc`](crate::InMemoryContainerMdSvc) /
//!   [`InMemoryFileMdSvc`](crate::InMemoryFileMdSvc): hash maps with an
//!   optional changelog file
//! - [`KvContainerMdSvc`](crate::KvContainerMdSvc) /
//!   [`KvFileMdSvc`](crate::KvFileMdSvc): any [`KvStore`](crate::KvStore),
//!   records encoded by a [`Codec`](crate::Codec)
//!
//! ## Lifecycle
//!
//! ```text
//! configure(options) → initialize() → create/get/update/remove … → finalize()
//! ```
//!
//! Every entity operation before `initialize()` fails with
//! [`NsError::InvalidState`].
//!
//! ## Events
//!
//! `update_store` publishes the entity's journaled changes followed by an
//! `Updated` event. `create_*` publishes `Created`, `remove_*` publishes
//! `Deleted`. Dispatch is synchronous and in registration order.
//!
//! ## Thread Safety
//!
//! All traits require `Send + Sync` and take `&self`; backends use interior
//! mutability. All traits are object-safe:
//!
//! ```rust
//! use namespace_md::{ContainerMdSvc, FileMdSvc};
//!
//! fn counts(files: &dyn FileMdSvc, dirs: &dyn ContainerMdSvc) -> (u64, u64) {
//!     (files.num_files().unwrap_or(0), dirs.num_containers().unwrap_or(0))
//! }
//! ```

mod listener;

use std::collections::HashMap;
use std::sync::Arc;

use crate::md::{ContainerMdPtr, FileMdPtr};
use crate::types::{ContainerId, FileId};
use crate::NsError;

pub use listener::{
    ContainerChange, ContainerMdChangeListener, ContainerMdEvent, FileChange,
    FileMdChangeListener, FileMdEvent, ListenerRegistry,
};

/// Container metadata service.
pub trait ContainerMdSvc: Send + Sync {
    /// Apply backend options. Must be called before [`initialize`](Self::initialize).
    fn configure(&self, options: &HashMap<String, String>) -> Result<(), NsError>;

    /// Connect to the backing store and load state.
    fn initialize(&self) -> Result<(), NsError>;

    /// Flush and release the backing store.
    fn finalize(&self) -> Result<(), NsError>;

    /// Allocate a fresh id and an empty, unattached container.
    fn create_container(&self) -> Result<ContainerMdPtr, NsError>;

    /// Look up a container by id.
    ///
    /// # Errors
    ///
    /// - [`NsError::IdNotFound`] if the id is unknown
    /// - [`NsError::Io`] / [`NsError::Backend`] on store failure
    fn get_container_md(&self, id: ContainerId) -> Result<ContainerMdPtr, NsError>;

    /// Persist the current in-memory state of a container.
    ///
    /// The record is produced by one encode call and written as one unit.
    fn update_store(&self, container: &ContainerMdPtr) -> Result<(), NsError>;

    /// Erase a container record.
    ///
    /// Removing an id that is already gone is a no-op.
    ///
    /// # Errors
    ///
    /// - [`NsError::InvalidState`] if the container still has children
    fn remove_container(&self, id: ContainerId) -> Result<(), NsError>;

    /// Number of live containers.
    fn num_containers(&self) -> Result<u64, NsError>;

    /// Whether stored records carry `tree_size`. When they do not, the
    /// aggregate is rebuilt on load and accounting leaves the store alone.
    fn persists_tree_size(&self) -> bool {
        true
    }

    /// Register an observer.
    fn add_change_listener(&self, listener: Arc<dyn ContainerMdChangeListener>);

    /// Invoke every registered observer with `event`.
    fn notify_listeners(&self, event: &ContainerMdEvent);
}

/// File metadata service.
pub trait FileMdSvc: Send + Sync {
    /// Apply backend options. Must be called before [`initialize`](Self::initialize).
    fn configure(&self, options: &HashMap<String, String>) -> Result<(), NsError>;

    /// Connect to the backing store and load state.
    fn initialize(&self) -> Result<(), NsError>;

    /// Flush and release the backing store.
    fn finalize(&self) -> Result<(), NsError>;

    /// Give the service access to containers (used to re-attach files when
    /// state is rebuilt from a log).
    fn set_container_service(&self, svc: Arc<dyn ContainerMdSvc>);

    /// Allocate a fresh id and an empty, detached file.
    fn create_file(&self) -> Result<FileMdPtr, NsError>;

    /// Look up a file by id.
    ///
    /// # Errors
    ///
    /// - [`NsError::IdNotFound`] if the id is unknown
    /// - [`NsError::Io`] / [`NsError::Backend`] on store failure
    fn get_file_md(&self, id: FileId) -> Result<FileMdPtr, NsError>;

    /// Persist the current in-memory state of a file.
    fn update_store(&self, file: &FileMdPtr) -> Result<(), NsError>;

    /// Erase a file record.
    ///
    /// Removing an id that is already gone is a no-op.
    ///
    /// # Errors
    ///
    /// - [`NsError::InvalidState`] if valid or unlinked replicas remain
    fn remove_file(&self, id: FileId) -> Result<(), NsError>;

    /// Number of live files.
    fn num_files(&self) -> Result<u64, NsError>;

    /// Register an observer.
    fn add_change_listener(&self, listener: Arc<dyn FileMdChangeListener>);

    /// Invoke every registered observer with `event`.
    fn notify_listeners(&self, event: &FileMdEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn services_are_object_safe() {
        fn _file(_: &dyn FileMdSvc) {}
        fn _container(_: &dyn ContainerMdSvc) {}
    }

    #[test]
    fn services_require_send_sync() {
        fn _assert_send_sync<T: Send + Sync + ?Sized>() {}
        _assert_send_sync::<dyn FileMdSvc>();
        _assert_send_sync::<dyn ContainerMdSvc>();
    }
}
