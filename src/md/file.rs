//! File metadata entity.

use std::collections::BTreeMap;

use super::ChangeJournal;
use crate::traits::FileChange;
use crate::types::{ContainerId, DETACHED, FileId, LocationId, MAX_FILE_SIZE, Timespec};
use crate::NsError;

/// Metadata of one file.
///
/// Replica placements are kept in two ordered lists: `locations` holds the
/// currently valid replicas, `unlinked_locations` the replicas waiting for
/// physical deletion. A location id appears in at most one of them.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FileMd {
    id: FileId,
    container_id: ContainerId,
    name: String,
    link: Option<String>,
    size: u64,
    flags: u16,
    cuid: u32,
    cgid: u32,
    layout_id: u32,
    checksum: Vec<u8>,
    locations: Vec<LocationId>,
    unlinked_locations: Vec<LocationId>,
    ctime: Timespec,
    mtime: Timespec,
    attributes: BTreeMap<String, String>,
    #[cfg_attr(feature = "serde", serde(skip))]
    changes: ChangeJournal<FileChange>,
}

impl FileMd {
    /// Create an empty, detached file with the given id.
    pub fn new(id: FileId) -> Self {
        Self {
            id,
            container_id: DETACHED,
            name: String::new(),
            link: None,
            size: 0,
            flags: 0,
            cuid: 0,
            cgid: 0,
            layout_id: 0,
            checksum: Vec::new(),
            locations: Vec::new(),
            unlinked_locations: Vec::new(),
            ctime: Timespec::default(),
            mtime: Timespec::default(),
            attributes: BTreeMap::new(),
            changes: ChangeJournal::default(),
        }
    }

    /// File id.
    #[inline]
    pub fn id(&self) -> FileId {
        self.id
    }

    /// Owning container, [`DETACHED`] when the file is not in the tree.
    #[inline]
    pub fn container_id(&self) -> ContainerId {
        self.container_id
    }

    /// Set the owning container.
    #[inline]
    pub fn set_container_id(&mut self, id: ContainerId) {
        self.container_id = id;
    }

    /// File name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the file name.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Symbolic link target, if this file is a link.
    #[inline]
    pub fn link(&self) -> Option<&str> {
        self.link.as_deref()
    }

    /// Turn the file into a symbolic link (or back with `None`).
    pub fn set_link(&mut self, target: Option<String>) {
        self.link = target.filter(|t| !t.is_empty());
    }

    /// Returns `true` if the file is a symbolic link.
    #[inline]
    pub fn is_link(&self) -> bool {
        self.link.is_some()
    }

    /// Logical size in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Set the size, truncated to 48 bits. Records a size-change entry when
    /// the value actually changes.
    pub fn set_size(&mut self, size: u64) {
        let size = size & MAX_FILE_SIZE;
        let delta = size as i64 - self.size as i64;
        self.size = size;
        if delta != 0 {
            self.changes.record(FileChange::SizeChange(delta));
        }
    }

    /// Flag bits.
    #[inline]
    pub fn flags(&self) -> u16 {
        self.flags
    }

    /// Set the flag bits.
    #[inline]
    pub fn set_flags(&mut self, flags: u16) {
        self.flags = flags;
    }

    /// Owner uid.
    #[inline]
    pub fn cuid(&self) -> u32 {
        self.cuid
    }

    /// Set the owner uid.
    #[inline]
    pub fn set_cuid(&mut self, uid: u32) {
        self.cuid = uid;
    }

    /// Owner gid.
    #[inline]
    pub fn cgid(&self) -> u32 {
        self.cgid
    }

    /// Set the owner gid.
    #[inline]
    pub fn set_cgid(&mut self, gid: u32) {
        self.cgid = gid;
    }

    /// Opaque layout (replication / erasure) encoding.
    #[inline]
    pub fn layout_id(&self) -> u32 {
        self.layout_id
    }

    /// Set the layout encoding.
    #[inline]
    pub fn set_layout_id(&mut self, layout_id: u32) {
        self.layout_id = layout_id;
    }

    /// Checksum bytes.
    #[inline]
    pub fn checksum(&self) -> &[u8] {
        &self.checksum
    }

    /// Replace the checksum bytes.
    pub fn set_checksum(&mut self, checksum: impl Into<Vec<u8>>) {
        self.checksum = checksum.into();
    }

    /// Drop the checksum.
    pub fn clear_checksum(&mut self) {
        self.checksum.clear();
    }

    /// Creation time.
    #[inline]
    pub fn ctime(&self) -> Timespec {
        self.ctime
    }

    /// Set the creation time.
    #[inline]
    pub fn set_ctime(&mut self, ctime: Timespec) {
        self.ctime = ctime;
    }

    /// Set the creation time to now.
    pub fn set_ctime_now(&mut self) {
        self.ctime = Timespec::now();
    }

    /// Modification time.
    #[inline]
    pub fn mtime(&self) -> Timespec {
        self.mtime
    }

    /// Set the modification time.
    #[inline]
    pub fn set_mtime(&mut self, mtime: Timespec) {
        self.mtime = mtime;
    }

    /// Set the modification time to now.
    pub fn set_mtime_now(&mut self) {
        self.mtime = Timespec::now();
    }

    // Locations

    /// Currently valid replica locations.
    #[inline]
    pub fn locations(&self) -> &[LocationId] {
        &self.locations
    }

    /// Replicas pending physical deletion.
    #[inline]
    pub fn unlinked_locations(&self) -> &[LocationId] {
        &self.unlinked_locations
    }

    /// Number of valid locations.
    #[inline]
    pub fn num_locations(&self) -> usize {
        self.locations.len()
    }

    /// Number of unlinked locations.
    #[inline]
    pub fn num_unlinked_locations(&self) -> usize {
        self.unlinked_locations.len()
    }

    /// Returns `true` if `location` is a valid replica.
    pub fn has_location(&self, location: LocationId) -> bool {
        self.locations.contains(&location)
    }

    /// Returns `true` if `location` is pending deletion.
    pub fn has_unlinked_location(&self, location: LocationId) -> bool {
        self.unlinked_locations.contains(&location)
    }

    /// Add a valid replica. A replica revived from the unlinked list leaves
    /// that list.
    pub fn add_location(&mut self, location: LocationId) {
        if self.has_location(location) {
            return;
        }
        self.unlinked_locations.retain(|l| *l != location);
        self.locations.push(location);
        self.changes.record(FileChange::LocationAdded(location));
    }

    /// Move a valid replica to the unlinked list.
    pub fn unlink_location(&mut self, location: LocationId) {
        let before = self.locations.len();
        self.locations.retain(|l| *l != location);
        if self.locations.len() == before {
            return;
        }
        self.unlinked_locations.push(location);
        self.changes.record(FileChange::LocationUnlinked(location));
    }

    /// Forget an unlinked replica once it has been physically deleted.
    pub fn remove_location(&mut self, location: LocationId) {
        let before = self.unlinked_locations.len();
        self.unlinked_locations.retain(|l| *l != location);
        if self.unlinked_locations.len() != before {
            self.changes.record(FileChange::LocationRemoved(location));
        }
    }

    /// Replace the valid replica at `index`. A replica pending deletion is
    /// revived; one that is already valid elsewhere is refused.
    pub fn replace_location(&mut self, index: usize, location: LocationId) -> Result<(), NsError> {
        let current = *self
            .locations
            .get(index)
            .ok_or_else(|| NsError::InvalidArgument {
                operation: "replace_location",
                reason: format!("no location at index {index}"),
            })?;
        if current == location {
            return Ok(());
        }
        if self.has_location(location) {
            return Err(NsError::InvalidArgument {
                operation: "replace_location",
                reason: format!("location {location} is already valid"),
            });
        }
        self.unlinked_locations.retain(|l| *l != location);
        let old = std::mem::replace(&mut self.locations[index], location);
        self.changes.record(FileChange::LocationReplaced { old, new: location });
        Ok(())
    }

    /// Move every valid replica to the unlinked list.
    pub fn unlink_all_locations(&mut self) {
        for location in self.locations.clone() {
            self.unlink_location(location);
        }
    }

    /// Forget every unlinked replica.
    pub fn remove_all_locations(&mut self) {
        for location in self.unlinked_locations.clone() {
            self.remove_location(location);
        }
    }

    // Extended attributes

    /// All extended attributes.
    #[inline]
    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    /// Look up one attribute.
    pub fn get_attribute(&self, key: &str) -> Result<&str, NsError> {
        self.attributes
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| NsError::AttributeNotFound { name: key.into() })
    }

    /// Returns `true` if the attribute is set.
    pub fn has_attribute(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }

    /// Set one attribute.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Remove one attribute.
    pub fn remove_attribute(&mut self, key: &str) -> Result<(), NsError> {
        self.attributes
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| NsError::AttributeNotFound { name: key.into() })
    }

    /// Drain the pending change journal.
    pub fn take_changes(&mut self) -> Vec<FileChange> {
        self.changes.drain()
    }

    /// Pending change entries.
    pub fn pending_changes(&self) -> usize {
        self.changes.len()
    }
}
