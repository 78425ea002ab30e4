//! # namespace-md
//!
//! Hierarchical namespace metadata engine: files and containers (directories)
//! addressed by numeric ids, resolved by path, persisted through pluggable
//! backends and observed by change listeners.
//!
//! ---
//!
//! ## Quick Start
//!
//! Wire a container service and a file service into a [`HierarchicalView`],
//! attach the accounting listeners you need, and initialize:
//!
//! ```rust
//! use std::sync::Arc;
//! use namespace_md::{
//!     ContainerAccounting, ContainerMdSvc, FileMdSvc, HierarchicalView,
//!     InMemoryContainerMdSvc, InMemoryFileMdSvc, SyncTimeAccounting,
//! };
//!
//! let containers: Arc<dyn ContainerMdSvc> = Arc::new(InMemoryContainerMdSvc::new());
//! let files: Arc<dyn FileMdSvc> = Arc::new(InMemoryFileMdSvc::new());
//! containers.add_change_listener(Arc::new(SyncTimeAccounting::new(&containers)));
//!
//! let view = HierarchicalView::new(containers.clone(), files)
//!     .with_accounting(Arc::new(ContainerAccounting::new(containers)));
//! view.initialize()?;
//!
//! view.create_container("/a/b", true)?;
//! let file = view.create_file("/a/b/f", 1000, 1000)?;
//! file.write().set_size(100);
//! view.update_file_store(&file)?;
//!
//! assert_eq!(view.get_container("/a")?.read().tree_size(), 100);
//! # Ok::<(), namespace_md::NsError>(())
//! ```
//!
//! ---
//!
//! ## Core Types
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`FileMd`] / [`ContainerMd`] | Entity records, shared as [`FileMdPtr`] / [`ContainerMdPtr`] |
//! | [`FileMdSvc`] / [`ContainerMdSvc`] | Id-keyed entity services |
//! | [`HierarchicalView`] | Path-based facade over both services |
//! | [`Codec`] | Entity record encoding ([`BinaryCodec`], `JsonCodec`) |
//! | [`ContainerAccounting`] / [`SyncTimeAccounting`] | Derived tree size and propagated mtime |
//! | [`QuotaStats`] / [`QuotaNode`] | Quota collaborator contract |
//! | [`NsError`] | Error type with errno-like [`codes`] |
//!
//! ---
//!
//! ## Backends
//!
//! | Backend | Persistence | Options |
//! |---------|-------------|---------|
//! | [`InMemoryContainerMdSvc`] / [`InMemoryFileMdSvc`] | append-only [`Changelog`], replayed on initialize | `changelog_path` |
//! | [`KvContainerMdSvc`] / [`KvFileMdSvc`] | any [`KvStore`], SQLite by default | `sqlite_path`, `cache_size` |
//!
//! Services are configured with a string map before `initialize`; see
//! [`config`] for the keys.
//!
//! ---
//!
//! ## Change Events
//!
//! Entity mutators record what changed. `update_store` persists the entity,
//! then publishes one event per recorded change followed by `Updated`, after
//! every entity lock is released. Listeners run synchronously on the
//! mutating thread.
//!
//! ---
//!
//! ## Thread Safety
//!
//! Services and the view take `&self` and are `Send + Sync`. Entities sit
//! behind `parking_lot::RwLock`; the view serializes structural changes with
//! one namespace lock.
//!
//! ---
//!
//! ## Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `serde` | `Serialize`/`Deserialize` on entities and the self-contained `JsonCodec` |

// Private modules
mod accounting;
mod codec;
mod error;
mod md;
mod quota;
mod svc;
mod traits;
mod types;
mod view;

pub mod config;

// Public re-exports - errors
pub use error::{codes, EntityKind, NsError};

// Public re-exports - core types
pub use types::{
    ContainerId, FileId, LocationId, Timespec, DEFAULT_CONTAINER_MODE, DETACHED, MAX_FILE_SIZE,
    MAX_SYMLINK_DEPTH, MAX_TREE_DEPTH, MTIME_NSEC_ATTR, MTIME_SEC_ATTR, QUOTA_NODE_FLAG, ROOT_ID,
    SYNC_TIME_ATTR,
};

// Public re-exports - entities
pub use md::{ChangeJournal, ChildDelta, ContainerMd, ContainerMdPtr, FileMd, FileMdPtr};

// Public re-exports - codecs
pub use codec::{BinaryCodec, Buffer, BufferReader, Codec};

// Public re-exports - configuration
pub use config::Options;

// Public re-exports - service contracts and events
pub use traits::{
    ContainerChange, ContainerMdChangeListener, ContainerMdEvent, ContainerMdSvc, FileChange,
    FileMdChangeListener, FileMdEvent, FileMdSvc, ListenerRegistry,
};

// Public re-exports - backends
pub use svc::{
    Changelog, InMemoryContainerMdSvc, InMemoryFileMdSvc, KvContainerMdSvc, KvFileMdSvc, KvOp,
    KvStore, LogRecord, MemoryKvStore, SqliteKvStore,
};

// Public re-exports - accounting
pub use accounting::{ContainerAccounting, SyncTimeAccounting};

// Public re-exports - quota
pub use quota::{InMemoryQuotaNode, InMemoryQuotaStats, QuotaNode, QuotaNodeCore, QuotaStats, UsageInfo};

// Public re-exports - view
pub use view::{abs_path, split_path, HierarchicalView, Listing};

// Conditional re-exports
#[cfg(feature = "serde")]
pub use codec::JsonCodec;
