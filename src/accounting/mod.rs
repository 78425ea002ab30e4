//! # Accounting Listeners
//!
//! Derived container aggregates kept current by observing service events.
//!
//! | Listener | Registered on | Event | Maintains |
//! |----------|---------------|-------|-----------|
//! | [`ContainerAccounting`] | file service | `SizeChange` | `tree_size` of every ancestor |
//! | [`SyncTimeAccounting`] | container service | `MTimeChange` | `tmtime` of opted-in ancestors |
//!
//! Both walks follow `parent_id` links, visit at most
//! [`MAX_TREE_DEPTH`](crate::types::MAX_TREE_DEPTH) containers and treat a
//! container that is its own parent as the root. They re-read every ancestor
//! from the service, so a concurrent move of a file between subtrees can be
//! counted against the old or the new parent for the one update that races
//! with it.
//!
//! ```rust
//! use std::sync::Arc;
//! use namespace_md::{
//!     ContainerAccounting, ContainerMdSvc, FileMdSvc, InMemoryContainerMdSvc,
//!     InMemoryFileMdSvc, SyncTimeAccounting,
//! };
//!
//! let containers: Arc<dyn ContainerMdSvc> = Arc::new(InMemoryContainerMdSvc::new());
//! let files: Arc<dyn FileMdSvc> = Arc::new(InMemoryFileMdSvc::new());
//! files.add_change_listener(Arc::new(ContainerAccounting::new(containers.clone())));
//! containers.add_change_listener(Arc::new(SyncTimeAccounting::new(&containers)));
//! ```

mod container_accounting;
mod sync_time;

pub use container_accounting::ContainerAccounting;
pub use sync_time::SyncTimeAccounting;
