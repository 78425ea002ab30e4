//! Core types shared by the entity model, services and the view.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Identifier of a [`FileMd`](crate::FileMd).
pub type FileId = u64;

/// Identifier of a [`ContainerMd`](crate::ContainerMd).
pub type ContainerId = u64;

/// Identifier of a physical replica placement (file system id).
pub type LocationId = u32;

/// The root container always has id 1 and is its own parent.
pub const ROOT_ID: ContainerId = 1;

/// `container_id` value of a file that is not attached to any container.
pub const DETACHED: ContainerId = 0;

/// Container flag bit marking a quota node.
pub const QUOTA_NODE_FLAG: u16 = 0x0001;

/// Extended attribute enabling mtime propagation through a container.
pub const SYNC_TIME_ATTR: &str = "sys.mtime.propagation";

/// Reserved attribute key carrying mtime seconds in the binary layout.
pub const MTIME_SEC_ATTR: &str = "sys.mtime.s";

/// Reserved attribute key carrying mtime nanoseconds in the binary layout.
pub const MTIME_NSEC_ATTR: &str = "sys.mtime.ns";

/// Maximum number of symbolic links followed while resolving one path.
pub const MAX_SYMLINK_DEPTH: usize = 255;

/// Maximum number of ancestors visited by an accounting walk.
pub const MAX_TREE_DEPTH: usize = 255;

/// Largest value representable by the 48-bit file size field.
pub const MAX_FILE_SIZE: u64 = 0x0000_ffff_ffff_ffff;

/// Default mode of a new container (`S_IFDIR | 0o755`).
pub const DEFAULT_CONTAINER_MODE: u32 = 0o040755;

/// Seconds + nanoseconds timestamp, ordered chronologically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Timespec {
    /// Seconds since the Unix epoch.
    pub sec: u64,
    /// Nanoseconds within the second.
    pub nsec: u64,
}

impl Timespec {
    /// Build a timestamp from its parts.
    #[inline]
    pub const fn new(sec: u64, nsec: u64) -> Self {
        Self { sec, nsec }
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        SystemTime::now().into()
    }
}

impl From<SystemTime> for Timespec {
    fn from(time: SystemTime) -> Self {
        let duration = time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        Self {
            sec: duration.as_secs(),
            nsec: u64::from(duration.subsec_nanos()),
        }
    }
}

impl From<Timespec> for SystemTime {
    fn from(ts: Timespec) -> Self {
        UNIX_EPOCH + Duration::new(ts.sec, (ts.nsec % 1_000_000_000) as u32)
    }
}
