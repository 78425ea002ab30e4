//! Key-value-store-backed services.
//!
//! ## Key Layout
//!
//! | Key | Kind | Contents |
//! |-----|------|----------|
//! | `c:<id>` | record | encoded container |
//! | `f:<id>` | record | encoded file |
//! | `c:<id>:dirs` | hash | subcontainer name → id (decimal) |
//! | `c:<id>:files` | hash | file name → id (decimal) |
//! | `c:<id>:meta` | hash | `tree_size` (decimal) |
//! | `meta:next_cid` / `meta:next_fid` | record | next free id (decimal) |
//!
//! The hashes are only written when the codec is not
//! [self-contained](crate::Codec::self_contained).

mod memory_store;
mod service;
mod sqlite;

pub use memory_store::MemoryKvStore;
pub use service::{KvContainerMdSvc, KvFileMdSvc};
pub use sqlite::SqliteKvStore;

use crate::NsError;

/// One write in a [`KvStore::apply`] batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    /// Store a record.
    Set {
        /// Record key.
        key: String,
        /// Record bytes.
        value: Vec<u8>,
    },
    /// Erase a record.
    Delete {
        /// Record key.
        key: String,
    },
    /// Store one hash field.
    HSet {
        /// Hash key.
        key: String,
        /// Field name.
        field: String,
        /// Field bytes.
        value: Vec<u8>,
    },
    /// Erase one hash field.
    HDel {
        /// Hash key.
        key: String,
        /// Field name.
        field: String,
    },
    /// Erase a whole hash.
    HClear {
        /// Hash key.
        key: String,
    },
}

impl KvOp {
    /// Key the operation writes to.
    pub fn key(&self) -> &str {
        match self {
            KvOp::Set { key, .. }
            | KvOp::Delete { key }
            | KvOp::HSet { key, .. }
            | KvOp::HDel { key, .. }
            | KvOp::HClear { key } => key,
        }
    }
}

/// Minimal key-value store contract: flat records plus field hashes.
///
/// `apply` is all-or-nothing. When any operation of a batch fails, none of
/// the batch is visible and the error lists every failure, not just the
/// first one.
pub trait KvStore: Send + Sync {
    /// Read a record.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, NsError>;

    /// Read one hash field.
    fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, NsError>;

    /// Read every field of a hash, ordered by field name.
    fn hget_all(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, NsError>;

    /// Number of records whose key starts with `prefix`.
    fn count_prefix(&self, prefix: &str) -> Result<u64, NsError>;

    /// Apply a batch of writes atomically.
    fn apply(&self, batch: &[KvOp]) -> Result<(), NsError>;
}

/// Turn collected per-operation failures into one batch result.
pub(crate) fn aggregate(operation: &'static str, failures: Vec<String>) -> Result<(), NsError> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(NsError::Io {
            operation,
            details: failures.join("; "),
        })
    }
}

pub(crate) mod keys {
    use crate::types::{ContainerId, FileId};

    pub(crate) const CONTAINER_PREFIX: &str = "c:";
    pub(crate) const FILE_PREFIX: &str = "f:";
    pub(crate) const NEXT_CONTAINER_ID: &str = "meta:next_cid";
    pub(crate) const NEXT_FILE_ID: &str = "meta:next_fid";
    pub(crate) const TREE_SIZE_FIELD: &str = "tree_size";

    pub(crate) fn container(id: ContainerId) -> String {
        format!("{CONTAINER_PREFIX}{id}")
    }

    pub(crate) fn subcontainers(id: ContainerId) -> String {
        format!("{CONTAINER_PREFIX}{id}:dirs")
    }

    pub(crate) fn files(id: ContainerId) -> String {
        format!("{CONTAINER_PREFIX}{id}:files")
    }

    pub(crate) fn meta(id: ContainerId) -> String {
        format!("{CONTAINER_PREFIX}{id}:meta")
    }

    pub(crate) fn file(id: FileId) -> String {
        format!("{FILE_PREFIX}{id}")
    }
}

/// Decode a decimal value stored by this module.
pub(crate) fn decode_u64(raw: &[u8]) -> Result<u64, NsError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| NsError::corrupted(format!("expected a decimal number, got {raw:?}")))
}

/// Encode a decimal value.
pub(crate) fn encode_u64(value: u64) -> Vec<u8> {
    value.to_string().into_bytes()
}
