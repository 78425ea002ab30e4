//! Error types for the namespace metadata engine.

/// Stable errno-like codes reported by [`NsError::code`].
///
/// A hosting server translates these into its protocol status without
/// inspecting the error text.
pub mod codes {
    /// Operation not permitted.
    pub const EPERM: i32 = 1;
    /// No such file or directory.
    pub const ENOENT: i32 = 2;
    /// Input/output error.
    pub const EIO: i32 = 5;
    /// Entry already exists.
    pub const EEXIST: i32 = 17;
    /// Not a directory.
    pub const ENOTDIR: i32 = 20;
    /// Is a directory.
    pub const EISDIR: i32 = 21;
    /// Invalid argument.
    pub const EINVAL: i32 = 22;
    /// Too many levels of symbolic links.
    pub const ELOOP: i32 = 40;
    /// Directory not empty.
    pub const ENOTEMPTY: i32 = 39;
    /// No data available (missing extended attribute).
    pub const ENODATA: i32 = 61;
    /// File descriptor in bad state.
    pub const EBADFD: i32 = 77;
}

/// Kind of metadata entity an id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// A [`FileMd`](crate::FileMd).
    File,
    /// A [`ContainerMd`](crate::ContainerMd).
    Container,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::File => f.write_str("file"),
            EntityKind::Container => f.write_str("container"),
        }
    }
}

/// Namespace error type with contextual variants.
///
/// Every variant maps to a stable code through [`NsError::code`]; the
/// message is advisory only.
///
/// # Examples
///
/// ```rust
/// use namespace_md::NsError;
///
/// let err = NsError::NotFound { path: "/missing".into() };
/// assert_eq!(err.to_string(), "not found: /missing");
/// assert_eq!(err.code(), namespace_md::codes::ENOENT);
/// ```
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum NsError {
    // Resolution errors
    /// Path does not resolve.
    #[error("not found: {path}")]
    NotFound {
        /// The path that was not found.
        path: String,
    },

    /// Entity id is unknown to the owning service.
    #[error("{kind} #{id} not found")]
    IdNotFound {
        /// Kind of entity looked up.
        kind: EntityKind,
        /// The id that was not found.
        id: u64,
    },

    /// Name collision.
    #[error("{operation}: already exists: {path}")]
    AlreadyExists {
        /// The colliding path or name.
        path: String,
        /// The operation that failed.
        operation: &'static str,
    },

    /// Expected a file but found a container.
    #[error("not a file: {path}")]
    NotAFile {
        /// The offending path.
        path: String,
    },

    /// Expected a container but found a file.
    #[error("not a directory: {path}")]
    NotADirectory {
        /// The offending path.
        path: String,
    },

    /// Non-recursive removal of a populated container.
    #[error("directory not empty: {path}")]
    NotEmpty {
        /// The container path.
        path: String,
    },

    /// Symbolic link loop or excessive link depth.
    #[error("too many levels of symbolic links: {path}")]
    TooManySymlinks {
        /// The path being resolved when the limit was hit.
        path: String,
    },

    /// Extended attribute lookup failed.
    #[error("attribute not found: {name}")]
    AttributeNotFound {
        /// The attribute name.
        name: String,
    },

    // State errors
    /// Entity or service is in a state that forbids the operation.
    #[error("{operation}: invalid state: {reason}")]
    InvalidState {
        /// The operation that was refused.
        operation: &'static str,
        /// Why the state forbids it.
        reason: String,
    },

    /// Structural operation on the root.
    #[error("{operation}: permission denied: {path}")]
    PermissionDenied {
        /// The path the operation targeted.
        path: String,
        /// The operation that was denied.
        operation: &'static str,
    },

    /// Caller supplied an unusable argument (empty name, embedded `/`, ...).
    #[error("{operation}: invalid argument: {reason}")]
    InvalidArgument {
        /// The operation that was refused.
        operation: &'static str,
        /// Description of the problem.
        reason: String,
    },

    /// Configuration option could not be used.
    #[error("invalid option {key}: {reason}")]
    InvalidConfig {
        /// The option key.
        key: String,
        /// Why the value is unusable.
        reason: String,
    },

    // Persistence errors
    /// A record could not be decoded.
    #[error("corrupted record: {details}")]
    Corrupted {
        /// What was wrong with the bytes.
        details: String,
    },

    /// Persistence failure. `details` aggregates every failed write.
    #[error("{operation} failed: {details}")]
    Io {
        /// The operation that failed.
        operation: &'static str,
        /// All collected failure messages.
        details: String,
    },

    /// Backing store client error.
    #[error("backend error: {0}")]
    Backend(String),
}

impl NsError {
    /// Errno-like code for this error kind.
    pub fn code(&self) -> i32 {
        match self {
            NsError::NotFound { .. } | NsError::IdNotFound { .. } => codes::ENOENT,
            NsError::AlreadyExists { .. } => codes::EEXIST,
            NsError::NotAFile { .. } => codes::EISDIR,
            NsError::NotADirectory { .. } => codes::ENOTDIR,
            NsError::NotEmpty { .. } => codes::ENOTEMPTY,
            NsError::TooManySymlinks { .. } => codes::ELOOP,
            NsError::AttributeNotFound { .. } => codes::ENODATA,
            NsError::InvalidState { .. } => codes::EBADFD,
            NsError::PermissionDenied { .. } => codes::EPERM,
            NsError::InvalidArgument { .. } | NsError::InvalidConfig { .. } => codes::EINVAL,
            NsError::Corrupted { .. } | NsError::Io { .. } | NsError::Backend(_) => codes::EIO,
        }
    }

    /// Returns `true` for the not-found family (path or id).
    pub fn is_not_found(&self) -> bool {
        matches!(self, NsError::NotFound { .. } | NsError::IdNotFound { .. })
    }

    pub(crate) fn uninitialized(operation: &'static str) -> Self {
        NsError::InvalidState {
            operation,
            reason: "service is not initialized".into(),
        }
    }

    pub(crate) fn corrupted(details: impl Into<String>) -> Self {
        NsError::Corrupted {
            details: details.into(),
        }
    }
}

impl From<std::io::Error> for NsError {
    fn from(error: std::io::Error) -> Self {
        NsError::Io {
            operation: "io",
            details: error.to_string(),
        }
    }
}

impl From<rusqlite::Error> for NsError {
    fn from(error: rusqlite::Error) -> Self {
        NsError::Backend(error.to_string())
    }
}
