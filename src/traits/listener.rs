//! Change events and the observer contract.
//!
//! Events are plain values carrying ids, never entity references, so a
//! listener is free to look entities up (and lock them) while it runs.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::types::{ContainerId, FileId, LocationId};

/// What happened to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChange {
    /// The record was stored.
    Updated,
    /// The record was erased.
    Deleted,
    /// A new file was allocated.
    Created,
    /// A valid replica was added.
    LocationAdded(LocationId),
    /// A valid replica was moved to the unlinked list.
    LocationUnlinked(LocationId),
    /// An unlinked replica was forgotten.
    LocationRemoved(LocationId),
    /// A valid replica was swapped for another.
    LocationReplaced {
        /// Replica that left.
        old: LocationId,
        /// Replica that took its slot.
        new: LocationId,
    },
    /// The logical size changed by the signed delta.
    SizeChange(i64),
}

/// A file change together with the ids observers need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMdEvent {
    /// The file.
    pub file_id: FileId,
    /// The container the file belonged to when the event was published.
    pub container_id: ContainerId,
    /// The change.
    pub change: FileChange,
}

impl FileMdEvent {
    /// Build an event.
    pub fn new(file_id: FileId, container_id: ContainerId, change: FileChange) -> Self {
        Self {
            file_id,
            container_id,
            change,
        }
    }
}

/// What happened to a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerChange {
    /// The record was stored.
    Updated,
    /// The record was erased.
    Deleted,
    /// A new container was allocated.
    Created,
    /// The modification time changed and should propagate upward.
    MTimeChange,
}

/// A container change together with the ids observers need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerMdEvent {
    /// The container.
    pub container_id: ContainerId,
    /// Its parent when the event was published.
    pub parent_id: ContainerId,
    /// The change.
    pub change: ContainerChange,
}

impl ContainerMdEvent {
    /// Build an event.
    pub fn new(container_id: ContainerId, parent_id: ContainerId, change: ContainerChange) -> Self {
        Self {
            container_id,
            parent_id,
            change,
        }
    }
}

/// Observer of file mutations.
///
/// Invoked synchronously on the mutating thread. A panicking listener is a
/// programming error and aborts the rest of the dispatch.
pub trait FileMdChangeListener: Send + Sync {
    /// Handle one event.
    fn file_md_changed(&self, event: &FileMdEvent);
}

/// Observer of container mutations.
///
/// Same dispatch rules as [`FileMdChangeListener`].
pub trait ContainerMdChangeListener: Send + Sync {
    /// Handle one event.
    fn container_md_changed(&self, event: &ContainerMdEvent);
}

/// Registration-ordered list of listeners.
///
/// Dispatch runs over a snapshot so listeners may call back into the
/// service that owns the registry.
pub struct ListenerRegistry<L: ?Sized> {
    listeners: RwLock<Vec<Arc<L>>>,
}

impl<L: ?Sized> ListenerRegistry<L> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener after all existing ones.
    pub fn add(&self, listener: Arc<L>) {
        self.listeners.write().push(listener);
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Returns `true` if nobody listens.
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<L>> {
        self.listeners.read().clone()
    }
}

impl<L: ?Sized> Default for ListenerRegistry<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerRegistry<dyn FileMdChangeListener> {
    /// Invoke every listener in registration order.
    pub fn dispatch(&self, event: &FileMdEvent) {
        for listener in self.snapshot() {
            listener.file_md_changed(event);
        }
    }
}

impl ListenerRegistry<dyn ContainerMdChangeListener> {
    /// Invoke every listener in registration order.
    pub fn dispatch(&self, event: &ContainerMdEvent) {
        for listener in self.snapshot() {
            listener.container_md_changed(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder {
        tag: &'static str,
        seen: Arc<Mutex<Vec<(&'static str, FileChange)>>>,
    }

    impl FileMdChangeListener for Recorder {
        fn file_md_changed(&self, event: &FileMdEvent) {
            self.seen.lock().push((self.tag, event.change));
        }
    }

    #[test]
    fn dispatch_follows_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry: ListenerRegistry<dyn FileMdChangeListener> = ListenerRegistry::new();
        registry.add(Arc::new(Recorder {
            tag: "first",
            seen: seen.clone(),
        }));
        registry.add(Arc::new(Recorder {
            tag: "second",
            seen: seen.clone(),
        }));

        registry.dispatch(&FileMdEvent::new(1, 2, FileChange::SizeChange(5)));

        assert_eq!(
            *seen.lock(),
            vec![
                ("first", FileChange::SizeChange(5)),
                ("second", FileChange::SizeChange(5)),
            ]
        );
    }

    #[test]
    fn listener_traits_are_object_safe() {
        fn _file(_: &dyn FileMdChangeListener) {}
        fn _container(_: &dyn ContainerMdChangeListener) {}
    }
}
