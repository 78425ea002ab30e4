//! Container (directory) metadata entity.

use std::collections::{BTreeMap, HashMap};

use super::ChangeJournal;
use crate::traits::ContainerChange;
use crate::types::{
    ContainerId, DEFAULT_CONTAINER_MODE, FileId, MTIME_NSEC_ATTR, MTIME_SEC_ATTR,
    QUOTA_NODE_FLAG, Timespec,
};
use crate::NsError;

/// One edit of a container's child maps, recorded for backends that store
/// the maps outside the container record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildDelta {
    /// Subcontainer `name` now points to `id`.
    AddContainer {
        /// Child name.
        name: String,
        /// Child id.
        id: ContainerId,
    },
    /// Subcontainer `name` was erased.
    RemoveContainer {
        /// Child name.
        name: String,
    },
    /// File `name` now points to `id`.
    AddFile {
        /// Child name.
        name: String,
        /// Child id.
        id: FileId,
    },
    /// File `name` was erased.
    RemoveFile {
        /// Child name.
        name: String,
    },
    /// Both maps were emptied.
    Clear,
}

/// Metadata of one directory.
///
/// The two child maps are the authoritative name → id edges of the tree.
/// `tree_size` and `tmtime` are derived aggregates maintained by the
/// accounting listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ContainerMd {
    id: ContainerId,
    parent_id: ContainerId,
    name: String,
    flags: u16,
    mode: u32,
    cuid: u32,
    cgid: u32,
    acl_id: u16,
    ctime: Timespec,
    mtime: Timespec,
    tmtime: Timespec,
    attributes: BTreeMap<String, String>,
    tree_size: u64,
    subcontainers: HashMap<String, ContainerId>,
    files: HashMap<String, FileId>,
    #[cfg_attr(feature = "serde", serde(skip))]
    changes: ChangeJournal<ContainerChange>,
    #[cfg_attr(feature = "serde", serde(skip))]
    child_deltas: ChangeJournal<ChildDelta>,
}

impl ContainerMd {
    /// Create an empty, unattached container with the given id.
    pub fn new(id: ContainerId) -> Self {
        Self {
            id,
            parent_id: 0,
            name: String::new(),
            flags: 0,
            mode: DEFAULT_CONTAINER_MODE,
            cuid: 0,
            cgid: 0,
            acl_id: 0,
            ctime: Timespec::default(),
            mtime: Timespec::default(),
            tmtime: Timespec::default(),
            attributes: BTreeMap::new(),
            tree_size: 0,
            subcontainers: HashMap::new(),
            files: HashMap::new(),
            changes: ChangeJournal::default(),
            child_deltas: ChangeJournal::default(),
        }
    }

    /// Container id.
    #[inline]
    pub fn id(&self) -> ContainerId {
        self.id
    }

    /// Parent container id. The root is its own parent.
    #[inline]
    pub fn parent_id(&self) -> ContainerId {
        self.parent_id
    }

    /// Set the parent container id.
    #[inline]
    pub fn set_parent_id(&mut self, parent_id: ContainerId) {
        self.parent_id = parent_id;
    }

    /// Returns `true` for the self-parented root sentinel.
    #[inline]
    pub fn is_root(&self) -> bool {
        self.id == self.parent_id
    }

    /// Container name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the container name.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
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

    /// Returns `true` if the quota-node bit is set.
    #[inline]
    pub fn is_quota_node(&self) -> bool {
        self.flags & QUOTA_NODE_FLAG != 0
    }

    /// Mode bits.
    #[inline]
    pub fn mode(&self) -> u32 {
        self.mode
    }

    /// Set the mode bits.
    #[inline]
    pub fn set_mode(&mut self, mode: u32) {
        self.mode = mode;
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

    /// ACL id.
    #[inline]
    pub fn acl_id(&self) -> u16 {
        self.acl_id
    }

    /// Set the ACL id.
    #[inline]
    pub fn set_acl_id(&mut self, acl_id: u16) {
        self.acl_id = acl_id;
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

    /// Record that mtime changed so propagation listeners run on store.
    pub fn notify_mtime_change(&mut self) {
        self.changes.record(ContainerChange::MTimeChange);
    }

    /// Propagated modification time.
    #[inline]
    pub fn tmtime(&self) -> Timespec {
        self.tmtime
    }

    /// Raise the propagated modification time.
    ///
    /// Returns `false` and leaves the value untouched unless `tmtime` is
    /// strictly newer.
    pub fn set_tmtime(&mut self, tmtime: Timespec) -> bool {
        if tmtime > self.tmtime {
            self.tmtime = tmtime;
            true
        } else {
            false
        }
    }

    /// Recursive size of all files below this container.
    #[inline]
    pub fn tree_size(&self) -> u64 {
        self.tree_size
    }

    /// Overwrite the recursive size.
    #[inline]
    pub fn set_tree_size(&mut self, size: u64) {
        self.tree_size = size;
    }

    /// Apply a signed delta to the recursive size, saturating at the bounds.
    pub fn add_tree_size(&mut self, delta: i64) -> u64 {
        self.tree_size = self.tree_size.saturating_add_signed(delta);
        self.tree_size
    }

    // Child maps

    /// Id of the subcontainer called `name`.
    pub fn find_container(&self, name: &str) -> Option<ContainerId> {
        self.subcontainers.get(name).copied()
    }

    /// Id of the file called `name`.
    pub fn find_file(&self, name: &str) -> Option<FileId> {
        self.files.get(name).copied()
    }

    /// Insert a subcontainer edge.
    pub fn add_container(&mut self, name: impl Into<String>, id: ContainerId) {
        let name = name.into();
        self.subcontainers.insert(name.clone(), id);
        self.child_deltas.record(ChildDelta::AddContainer { name, id });
    }

    /// Erase a subcontainer edge, returning the id it pointed to.
    pub fn remove_container(&mut self, name: &str) -> Option<ContainerId> {
        let removed = self.subcontainers.remove(name);
        if removed.is_some() {
            self.child_deltas.record(ChildDelta::RemoveContainer { name: name.into() });
        }
        removed
    }

    /// Insert a file edge.
    pub fn add_file(&mut self, name: impl Into<String>, id: FileId) {
        let name = name.into();
        self.files.insert(name.clone(), id);
        self.child_deltas.record(ChildDelta::AddFile { name, id });
    }

    /// Erase a file edge, returning the id it pointed to.
    pub fn remove_file(&mut self, name: &str) -> Option<FileId> {
        let removed = self.files.remove(name);
        if removed.is_some() {
            self.child_deltas.record(ChildDelta::RemoveFile { name: name.into() });
        }
        removed
    }

    /// Empty both child maps.
    pub fn clean_up(&mut self) {
        self.subcontainers.clear();
        self.files.clear();
        self.child_deltas.record(ChildDelta::Clear);
    }

    /// Number of subcontainers.
    #[inline]
    pub fn num_containers(&self) -> usize {
        self.subcontainers.len()
    }

    /// Number of files.
    #[inline]
    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    /// Returns `true` if the container has no children.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.subcontainers.is_empty() && self.files.is_empty()
    }

    /// Subcontainer edges.
    pub fn containers(&self) -> impl Iterator<Item = (&str, ContainerId)> + '_ {
        self.subcontainers.iter().map(|(n, id)| (n.as_str(), *id))
    }

    /// File edges.
    pub fn files(&self) -> impl Iterator<Item = (&str, FileId)> + '_ {
        self.files.iter().map(|(n, id)| (n.as_str(), *id))
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

    /// Set one attribute. The reserved mtime keys are refused.
    pub fn set_attribute(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), NsError> {
        let key = key.into();
        if key == MTIME_SEC_ATTR || key == MTIME_NSEC_ATTR {
            return Err(NsError::InvalidArgument {
                operation: "set_attribute",
                reason: format!("{key} is reserved"),
            });
        }
        self.attributes.insert(key, value.into());
        Ok(())
    }

    /// Remove one attribute.
    pub fn remove_attribute(&mut self, key: &str) -> Result<(), NsError> {
        self.attributes
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| NsError::AttributeNotFound { name: key.into() })
    }

    /// Drain pending change notifications.
    pub fn take_changes(&mut self) -> Vec<ContainerChange> {
        self.changes.drain()
    }

    /// Pending child-map edits, not drained.
    pub fn child_deltas(&self) -> &[ChildDelta] {
        self.child_deltas.pending()
    }

    /// Drain pending child-map edits.
    pub fn take_child_deltas(&mut self) -> Vec<ChildDelta> {
        self.child_deltas.drain()
    }

    // Used by decoders that restore children without recording deltas.
    pub(crate) fn restore_children(
        &mut self,
        subcontainers: HashMap<String, ContainerId>,
        files: HashMap<String, FileId>,
    ) {
        self.subcontainers = subcontainers;
        self.files = files;
    }

    // Used by the binary decoder; bypasses the reserved-key check.
    pub(crate) fn attributes_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.attributes
    }

    // tmtime is not part of every layout and is restored by decoders.
    pub(crate) fn restore_tmtime(&mut self, tmtime: Timespec) {
        self.tmtime = tmtime;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_self_parented() {
        let mut root = ContainerMd::new(1);
        root.set_parent_id(1);
        assert!(root.is_root());

        let mut child = ContainerMd::new(2);
        child.set_parent_id(1);
        assert!(!child.is_root());
    }

    #[test]
    fn tmtime_is_monotonic() {
        let mut c = ContainerMd::new(2);
        assert!(c.set_tmtime(Timespec::new(10, 0)));
        assert!(!c.set_tmtime(Timespec::new(9, 999)));
        assert!(!c.set_tmtime(Timespec::new(10, 0)));
        assert!(c.set_tmtime(Timespec::new(10, 1)));
        assert_eq!(c.tmtime(), Timespec::new(10, 1));
    }

    #[test]
    fn tree_size_saturates() {
        let mut c = ContainerMd::new(2);
        assert_eq!(c.add_tree_size(100), 100);
        assert_eq!(c.add_tree_size(-30), 70);
        assert_eq!(c.add_tree_size(-1000), 0);
    }

    #[test]
    fn child_maps_record_deltas() {
        let mut c = ContainerMd::new(2);
        c.add_container("sub", 3);
        c.add_file("f", 10);
        assert_eq!(c.find_container("sub"), Some(3));
        assert_eq!(c.find_file("f"), Some(10));
        assert_eq!(c.remove_file("f"), Some(10));
        assert_eq!(c.remove_file("f"), None);
        assert_eq!(
            c.take_child_deltas(),
            vec![
                ChildDelta::AddContainer {
                    name: "sub".into(),
                    id: 3
                },
                ChildDelta::AddFile {
                    name: "f".into(),
                    id: 10
                },
                ChildDelta::RemoveFile { name: "f".into() },
            ]
        );
    }

    #[test]
    fn reserved_attribute_keys_are_refused() {
        let mut c = ContainerMd::new(2);
        assert!(c.set_attribute(MTIME_SEC_ATTR, "1").is_err());
        assert!(c.set_attribute("sys.mtime.propagation", "1").is_ok());
        assert!(c.has_attribute("sys.mtime.propagation"));
    }

    #[test]
    fn quota_flag_is_bit_zero() {
        let mut c = ContainerMd::new(2);
        assert!(!c.is_quota_node());
        c.set_flags(c.flags() | QUOTA_NODE_FLAG);
        assert!(c.is_quota_node());
        assert_eq!(c.flags() & 1, 1);
    }

    #[test]
    fn mtime_notification_is_journaled() {
        let mut c = ContainerMd::new(2);
        c.set_mtime_now();
        c.notify_mtime_change();
        assert_eq!(c.take_changes(), vec![ContainerChange::MTimeChange]);
        assert!(c.take_changes().is_empty());
    }
}
