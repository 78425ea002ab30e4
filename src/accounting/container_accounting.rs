//! Recursive tree-size accounting.

use std::sync::Arc;

use tracing::{error, warn};

use crate::traits::{ContainerMdSvc, FileChange, FileMdChangeListener, FileMdEvent};
use crate::types::{ContainerId, DETACHED, MAX_TREE_DEPTH};

/// Keeps `ContainerMd::tree_size` equal to the total size of all files
/// below each container.
///
/// Register it on the file service; every `SizeChange` event walks from the
/// file's container up to the root and adds the delta to each container on
/// the way. Each one is persisted when the container service stores tree
/// sizes.
pub struct ContainerAccounting {
    containers: Arc<dyn ContainerMdSvc>,
}

impl ContainerAccounting {
    /// Account against the containers of `containers`.
    pub fn new(containers: Arc<dyn ContainerMdSvc>) -> Self {
        Self { containers }
    }

    /// Add `size` bytes to `id` and all its ancestors.
    pub fn add_tree(&self, id: ContainerId, size: u64) {
        self.propagate(id, i64::try_from(size).unwrap_or(i64::MAX));
    }

    /// Subtract `size` bytes from `id` and all its ancestors.
    pub fn remove_tree(&self, id: ContainerId, size: u64) {
        self.propagate(id, -i64::try_from(size).unwrap_or(i64::MAX));
    }

    fn propagate(&self, start: ContainerId, delta: i64) {
        if delta == 0 || start == DETACHED {
            return;
        }
        let persist = self.containers.persists_tree_size();
        let mut id = start;
        for _ in 0..MAX_TREE_DEPTH {
            let container = match self.containers.get_container_md(id) {
                Ok(container) => container,
                Err(e) if e.is_not_found() => {
                    warn!(start, id, delta, "tree size walk lost its ancestor");
                    return;
                }
                Err(e) => {
                    error!(start, id, delta, error = %e, "tree size walk failed");
                    return;
                }
            };
            let parent_id = {
                let mut guard = container.write();
                guard.add_tree_size(delta);
                guard.parent_id()
            };
            if persist {
                if let Err(e) = self.containers.update_store(&container) {
                    error!(id, error = %e, "cannot persist tree size");
                }
            }
            if parent_id == id || parent_id == DETACHED {
                return;
            }
            id = parent_id;
        }
        warn!(start, delta, "tree size walk hit the depth cap");
    }
}

impl FileMdChangeListener for ContainerAccounting {
    fn file_md_changed(&self, event: &FileMdEvent) {
        if let FileChange::SizeChange(delta) = event.change {
            self.propagate(event.container_id, delta);
        }
    }
}
