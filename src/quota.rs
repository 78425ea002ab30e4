//! Quota collaborator contract and an in-memory implementation.
//!
//! The namespace only creates, finds and removes quota nodes keyed by
//! container id, and melds a removed node's usage into its nearest remaining
//! ancestor node. Charging files against nodes and enforcing limits belong to
//! the quota subsystem.

use std::collections::HashMap;
use std::ops::AddAssign;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::types::ContainerId;
use crate::NsError;

/// Usage charged to one uid or gid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageInfo {
    /// Logical bytes.
    pub space: u64,
    /// Bytes on disk, replicas and parity included.
    pub physical_space: u64,
    /// Number of files.
    pub files: u64,
}

impl AddAssign for UsageInfo {
    fn add_assign(&mut self, other: Self) {
        self.space += other.space;
        self.physical_space += other.physical_space;
        self.files += other.files;
    }
}

impl UsageInfo {
    fn subtract(&mut self, space: u64, physical_space: u64) {
        self.space = self.space.saturating_sub(space);
        self.physical_space = self.physical_space.saturating_sub(physical_space);
        self.files = self.files.saturating_sub(1);
    }
}

/// Per-user and per-group usage of one quota node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaNodeCore {
    users: HashMap<u32, UsageInfo>,
    groups: HashMap<u32, UsageInfo>,
}

impl QuotaNodeCore {
    /// Charge one file.
    pub fn add_file(&mut self, uid: u32, gid: u32, size: u64, physical_size: u64) {
        let usage = UsageInfo {
            space: size,
            physical_space: physical_size,
            files: 1,
        };
        *self.users.entry(uid).or_default() += usage;
        *self.groups.entry(gid).or_default() += usage;
    }

    /// Release one file.
    pub fn remove_file(&mut self, uid: u32, gid: u32, size: u64, physical_size: u64) {
        if let Some(usage) = self.users.get_mut(&uid) {
            usage.subtract(size, physical_size);
        }
        if let Some(usage) = self.groups.get_mut(&gid) {
            usage.subtract(size, physical_size);
        }
    }

    /// Add all of `other`'s usage to this node.
    pub fn meld(&mut self, other: &QuotaNodeCore) {
        for (uid, usage) in &other.users {
            *self.users.entry(*uid).or_default() += *usage;
        }
        for (gid, usage) in &other.groups {
            *self.groups.entry(*gid).or_default() += *usage;
        }
    }

    /// Usage charged to `uid`.
    pub fn user(&self, uid: u32) -> UsageInfo {
        self.users.get(&uid).copied().unwrap_or_default()
    }

    /// Usage charged to `gid`.
    pub fn group(&self, gid: u32) -> UsageInfo {
        self.groups.get(&gid).copied().unwrap_or_default()
    }

    /// Uids with recorded usage.
    pub fn uids(&self) -> impl Iterator<Item = u32> + '_ {
        self.users.keys().copied()
    }

    /// Gids with recorded usage.
    pub fn gids(&self) -> impl Iterator<Item = u32> + '_ {
        self.groups.keys().copied()
    }
}

/// Handle to the usage accounted below one quota-node container.
pub trait QuotaNode: Send + Sync {
    /// Container the node is attached to.
    fn container_id(&self) -> ContainerId;

    /// Copy of the current usage.
    fn usage(&self) -> QuotaNodeCore;

    /// Charge one file.
    fn add_file(&self, uid: u32, gid: u32, size: u64, physical_size: u64);

    /// Release one file.
    fn remove_file(&self, uid: u32, gid: u32, size: u64, physical_size: u64);

    /// Absorb the usage of `other`.
    fn meld(&self, other: &dyn QuotaNode);
}

/// Registry of quota nodes.
pub trait QuotaStats: Send + Sync {
    /// Create the node of container `id`.
    ///
    /// # Errors
    ///
    /// - [`NsError::AlreadyExists`] if the container already has a node
    fn register_new_node(&self, id: ContainerId) -> Result<Arc<dyn QuotaNode>, NsError>;

    /// The node of container `id`, if registered.
    fn get_quota_node(&self, id: ContainerId) -> Option<Arc<dyn QuotaNode>>;

    /// Forget the node of container `id`.
    fn remove_node(&self, id: ContainerId);
}

/// [`QuotaNode`] guarding a [`QuotaNodeCore`] with a mutex.
#[derive(Debug)]
pub struct InMemoryQuotaNode {
    container_id: ContainerId,
    core: Mutex<QuotaNodeCore>,
}

impl InMemoryQuotaNode {
    /// Empty node for container `container_id`.
    pub fn new(container_id: ContainerId) -> Self {
        Self {
            container_id,
            core: Mutex::new(QuotaNodeCore::default()),
        }
    }
}

impl QuotaNode for InMemoryQuotaNode {
    fn container_id(&self) -> ContainerId {
        self.container_id
    }

    fn usage(&self) -> QuotaNodeCore {
        self.core.lock().clone()
    }

    fn add_file(&self, uid: u32, gid: u32, size: u64, physical_size: u64) {
        self.core.lock().add_file(uid, gid, size, physical_size);
    }

    fn remove_file(&self, uid: u32, gid: u32, size: u64, physical_size: u64) {
        self.core.lock().remove_file(uid, gid, size, physical_size);
    }

    fn meld(&self, other: &dyn QuotaNode) {
        // `other` may be `self`.
        let other = other.usage();
        self.core.lock().meld(&other);
    }
}

/// [`QuotaStats`] keeping nodes in a hash map.
#[derive(Default)]
pub struct InMemoryQuotaStats {
    nodes: RwLock<HashMap<ContainerId, Arc<InMemoryQuotaNode>>>,
}

impl InMemoryQuotaStats {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered nodes.
    pub fn num_nodes(&self) -> usize {
        self.nodes.read().len()
    }

    /// Ids of all registered containers, ascending.
    pub fn node_ids(&self) -> Vec<ContainerId> {
        let mut ids: Vec<_> = self.nodes.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl QuotaStats for InMemoryQuotaStats {
    fn register_new_node(&self, id: ContainerId) -> Result<Arc<dyn QuotaNode>, NsError> {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&id) {
            return Err(NsError::AlreadyExists {
                path: format!("quota node #{id}"),
                operation: "register_new_node",
            });
        }
        let node = Arc::new(InMemoryQuotaNode::new(id));
        nodes.insert(id, node.clone());
        Ok(node)
    }

    fn get_quota_node(&self, id: ContainerId) -> Option<Arc<dyn QuotaNode>> {
        self.nodes
            .read()
            .get(&id)
            .map(|node| node.clone() as Arc<dyn QuotaNode>)
    }

    fn remove_node(&self, id: ContainerId) {
        self.nodes.write().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_tracks_users_and_groups() {
        let mut core = QuotaNodeCore::default();
        core.add_file(10, 20, 100, 200);
        core.add_file(10, 21, 50, 100);
        assert_eq!(
            core.user(10),
            UsageInfo {
                space: 150,
                physical_space: 300,
                files: 2
            }
        );
        assert_eq!(core.group(20).files, 1);
        core.remove_file(10, 20, 100, 200);
        assert_eq!(core.user(10).space, 50);
        assert_eq!(core.group(20), UsageInfo::default());
        assert_eq!(core.user(99), UsageInfo::default());
    }

    #[test]
    fn meld_adds_usage() {
        let a = InMemoryQuotaNode::new(1);
        let b = InMemoryQuotaNode::new(2);
        a.add_file(1, 1, 10, 20);
        b.add_file(1, 2, 5, 10);
        a.meld(&b);
        let usage = a.usage();
        assert_eq!(usage.user(1).space, 15);
        assert_eq!(usage.group(2).physical_space, 10);
        let mut uids: Vec<_> = usage.uids().collect();
        uids.sort_unstable();
        assert_eq!(uids, vec![1]);
    }

    #[test]
    fn self_meld_doubles_without_deadlock() {
        let a = InMemoryQuotaNode::new(1);
        a.add_file(1, 1, 10, 10);
        a.meld(&a);
        assert_eq!(a.usage().user(1).space, 20);
    }

    #[test]
    fn registry_refuses_duplicates() {
        let stats = InMemoryQuotaStats::new();
        stats.register_new_node(5).unwrap();
        assert!(matches!(
            stats.register_new_node(5),
            Err(NsError::AlreadyExists { .. })
        ));
        assert_eq!(stats.get_quota_node(5).unwrap().container_id(), 5);
        stats.remove_node(5);
        assert!(stats.get_quota_node(5).is_none());
        assert_eq!(stats.num_nodes(), 0);
    }
}
