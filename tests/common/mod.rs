//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use namespace_md::config::{CHANGELOG_PATH, SQLITE_PATH};
use namespace_md::*;
use tracing_subscriber::EnvFilter;

/// Route `tracing` output through the test harness. `RUST_LOG` selects the
/// level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A view wired with tree-size accounting, synchronous mtime propagation
/// and an in-memory quota registry.
pub struct Namespace {
    pub containers: Arc<dyn ContainerMdSvc>,
    pub files: Arc<dyn FileMdSvc>,
    pub quota: Arc<InMemoryQuotaStats>,
    pub view: HierarchicalView,
}

impl Namespace {
    /// Plain in-memory services.
    pub fn in_memory() -> Self {
        Self::build(
            Arc::new(InMemoryContainerMdSvc::new()),
            Arc::new(InMemoryFileMdSvc::new()),
        )
    }

    /// In-memory services persisting to changelogs in `dir`.
    pub fn with_changelogs(dir: &Path) -> Self {
        let containers = InMemoryContainerMdSvc::new();
        containers
            .configure(&option(CHANGELOG_PATH, &dir.join("containers.log")))
            .unwrap();
        let files = InMemoryFileMdSvc::new();
        files
            .configure(&option(CHANGELOG_PATH, &dir.join("files.log")))
            .unwrap();
        Self::build(Arc::new(containers), Arc::new(files))
    }

    /// Key-value services sharing one in-memory store.
    pub fn kv(store: Arc<MemoryKvStore>) -> Self {
        let containers: KvContainerMdSvc = KvContainerMdSvc::new().with_store(store.clone());
        let files: KvFileMdSvc = KvFileMdSvc::new().with_store(store);
        Self::build(Arc::new(containers), Arc::new(files))
    }

    /// Key-value services backed by SQLite databases in `dir`.
    pub fn sqlite(dir: &Path) -> Self {
        let containers: KvContainerMdSvc = KvContainerMdSvc::new();
        containers
            .configure(&option(SQLITE_PATH, &dir.join("containers.db")))
            .unwrap();
        let files: KvFileMdSvc = KvFileMdSvc::new();
        files
            .configure(&option(SQLITE_PATH, &dir.join("files.db")))
            .unwrap();
        Self::build(Arc::new(containers), Arc::new(files))
    }

    fn build(containers: Arc<dyn ContainerMdSvc>, files: Arc<dyn FileMdSvc>) -> Self {
        init_tracing();
        let quota = Arc::new(InMemoryQuotaStats::new());
        containers.add_change_listener(Arc::new(SyncTimeAccounting::new(&containers)));
        let view = HierarchicalView::new(containers.clone(), files.clone())
            .with_accounting(Arc::new(ContainerAccounting::new(containers.clone())))
            .with_quota_stats(quota.clone());
        view.initialize().unwrap();
        Self {
            containers,
            files,
            quota,
            view,
        }
    }

    /// Create a file and give it `size` bytes.
    pub fn file_with_size(&self, path: &str, size: u64) -> FileMdPtr {
        let file = self.view.create_file(path, 0, 0).unwrap();
        file.write().set_size(size);
        self.view.update_file_store(&file).unwrap();
        file
    }

    pub fn tree_size(&self, path: &str) -> u64 {
        self.view.get_container(path).unwrap().read().tree_size()
    }
}

/// Every backend flavour that needs no files on disk.
pub fn volatile_namespaces() -> Vec<(&'static str, Namespace)> {
    vec![
        ("memory", Namespace::in_memory()),
        ("kv", Namespace::kv(Arc::new(MemoryKvStore::new()))),
    ]
}

pub fn option(key: &str, value: &Path) -> HashMap<String, String> {
    HashMap::from([(key.to_string(), value.display().to_string())])
}

/// Walk the tree from the root checking that every child entry points at an
/// entity whose parent link and name agree, and that each entity is listed
/// once. Returns the recursive file size of every visited container.
pub fn check_tree(ns: &Namespace) -> HashMap<ContainerId, u64> {
    let mut sizes = HashMap::new();
    let mut seen_files = std::collections::HashSet::new();
    let root = ns.containers.get_container_md(ROOT_ID).unwrap();
    walk(ns, &root, &mut sizes, &mut seen_files);
    sizes
}

fn walk(
    ns: &Namespace,
    container: &ContainerMdPtr,
    sizes: &mut HashMap<ContainerId, u64>,
    seen_files: &mut std::collections::HashSet<FileId>,
) -> u64 {
    let (id, files, children) = {
        let guard = container.read();
        let files: Vec<(String, FileId)> =
            guard.files().map(|(n, id)| (n.to_string(), id)).collect();
        let children: Vec<(String, ContainerId)> =
            guard.containers().map(|(n, id)| (n.to_string(), id)).collect();
        (guard.id(), files, children)
    };
    assert!(!sizes.contains_key(&id), "container #{id} reachable twice");
    sizes.insert(id, 0);

    let mut total = 0;
    for (name, file_id) in files {
        let file = ns.files.get_file_md(file_id).unwrap();
        let guard = file.read();
        assert_eq!(guard.container_id(), id, "file {name} has a stale parent");
        assert_eq!(guard.name(), name);
        assert!(seen_files.insert(file_id), "file #{file_id} listed twice");
        total += guard.size();
    }
    for (name, child_id) in children {
        let child = ns.containers.get_container_md(child_id).unwrap();
        {
            let guard = child.read();
            assert_eq!(guard.parent_id(), id, "container {name} has a stale parent");
            assert_eq!(guard.name(), name);
        }
        total += walk(ns, &child, sizes, seen_files);
    }
    sizes.insert(id, total);
    total
}
