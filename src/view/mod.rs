//! # Hierarchical View
//!
//! Path-based entry point into the namespace. [`HierarchicalView`] turns
//! slash-separated paths into container and file lookups over a pair of
//! services and keeps parent child maps, file attachment and quota flags
//! consistent while doing so.
//!
//! | Operation | Shape |
//! |-----------|-------|
//! | Lookup | [`get_file`](HierarchicalView::get_file), [`get_container`](HierarchicalView::get_container), [`find_last_container`](HierarchicalView::find_last_container), [`list`](HierarchicalView::list) |
//! | Creation | [`create_file`](HierarchicalView::create_file), [`create_container`](HierarchicalView::create_container), [`create_link`](HierarchicalView::create_link) |
//! | Removal | [`unlink_file`](HierarchicalView::unlink_file), [`remove_file`](HierarchicalView::remove_file), [`remove_link`](HierarchicalView::remove_link), [`remove_container`](HierarchicalView::remove_container) |
//! | Renames and moves | [`rename_file`](HierarchicalView::rename_file), [`rename_container`](HierarchicalView::rename_container), [`move_file`](HierarchicalView::move_file), [`move_container`](HierarchicalView::move_container) |
//! | Paths | [`get_uri`](HierarchicalView::get_uri), [`get_file_uri`](HierarchicalView::get_file_uri), [`get_real_path`](HierarchicalView::get_real_path), [`abs_path`] |
//! | Quota | [`get_quota_node`](HierarchicalView::get_quota_node), [`register_quota_node`](HierarchicalView::register_quota_node), [`remove_quota_node`](HierarchicalView::remove_quota_node) |
//!
//! Lookups share one namespace lock and mutations take it exclusively. The
//! private helpers below run with the lock already held and never take it
//! again.

mod path;

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

pub use path::{abs_path, split_path};

use crate::accounting::ContainerAccounting;
use crate::md::{ContainerMd, ContainerMdPtr, FileMdPtr};
use crate::quota::{QuotaNode, QuotaStats};
use crate::svc::{check_file_removable, Lifecycle};
use crate::traits::{ContainerMdSvc, FileChange, FileMdEvent, FileMdSvc};
use crate::types::{
    ContainerId, FileId, Timespec, DETACHED, MAX_SYMLINK_DEPTH, MAX_TREE_DEPTH, QUOTA_NODE_FLAG,
    ROOT_ID,
};
use crate::NsError;
use path::check_name;

/// Names directly below one container, each list sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    /// Subcontainer names.
    pub containers: Vec<String>,
    /// File and symbolic link names.
    pub files: Vec<String>,
}

/// Path-based facade over a container service and a file service.
///
/// ```rust
/// use std::sync::Arc;
/// use namespace_md::{
///     ContainerMdSvc, FileMdSvc, HierarchicalView, InMemoryContainerMdSvc, InMemoryFileMdSvc,
/// };
///
/// let containers: Arc<dyn ContainerMdSvc> = Arc::new(InMemoryContainerMdSvc::new());
/// let files: Arc<dyn FileMdSvc> = Arc::new(InMemoryFileMdSvc::new());
/// let view = HierarchicalView::new(containers, files);
/// view.initialize().unwrap();
///
/// view.create_container("/data/raw", true).unwrap();
/// let file = view.create_file("/data/raw/run1", 1000, 1000).unwrap();
/// assert_eq!(view.get_file_uri(&file).unwrap(), "/data/raw/run1");
/// assert_eq!(view.get_real_path("/data/./raw/../raw/x").unwrap(), "/data/raw/x");
/// ```
pub struct HierarchicalView {
    containers: Arc<dyn ContainerMdSvc>,
    files: Arc<dyn FileMdSvc>,
    quota: Option<Arc<dyn QuotaStats>>,
    accounting: Option<Arc<ContainerAccounting>>,
    namespace: RwLock<()>,
    state: Lifecycle,
}

impl HierarchicalView {
    /// Bind the view to its services. The file service learns about the
    /// container service here.
    pub fn new(containers: Arc<dyn ContainerMdSvc>, files: Arc<dyn FileMdSvc>) -> Self {
        files.set_container_service(containers.clone());
        Self {
            containers,
            files,
            quota: None,
            accounting: None,
            namespace: RwLock::new(()),
            state: Lifecycle::default(),
        }
    }

    /// Attach a quota registry.
    pub fn with_quota_stats(mut self, stats: Arc<dyn QuotaStats>) -> Self {
        self.quota = Some(stats);
        self
    }

    /// Attach tree-size accounting and register it on the file service.
    ///
    /// Call before [`initialize`](Self::initialize) so that sizes replayed by
    /// the file service are accounted too.
    pub fn with_accounting(mut self, accounting: Arc<ContainerAccounting>) -> Self {
        self.files.add_change_listener(accounting.clone());
        self.accounting = Some(accounting);
        self
    }

    /// The container service.
    pub fn container_service(&self) -> &Arc<dyn ContainerMdSvc> {
        &self.containers
    }

    /// The file service.
    pub fn file_service(&self) -> &Arc<dyn FileMdSvc> {
        &self.files
    }

    /// The quota registry, if attached.
    pub fn quota_stats(&self) -> Option<&Arc<dyn QuotaStats>> {
        self.quota.as_ref()
    }

    // Lifecycle

    /// Initialize both services and make sure the root exists.
    ///
    /// A missing root is created as id 1, named `/`, and its own parent.
    pub fn initialize(&self) -> Result<(), NsError> {
        let _guard = self.namespace.write();
        self.state.ensure_not("initialize")?;
        self.containers.initialize()?;
        match self.containers.get_container_md(ROOT_ID) {
            Ok(_) => {}
            Err(e) if e.is_not_found() => self.create_root()?,
            Err(e) => return Err(e),
        }
        self.files.initialize()?;
        self.state.set(true);
        info!(
            containers = self.containers.num_containers()?,
            files = self.files.num_files()?,
            "namespace initialized"
        );
        Ok(())
    }

    /// Finalize both services.
    pub fn finalize(&self) -> Result<(), NsError> {
        let _guard = self.namespace.write();
        self.state.ensure("finalize")?;
        self.state.set(false);
        self.files.finalize()?;
        self.containers.finalize()?;
        info!("namespace finalized");
        Ok(())
    }

    fn create_root(&self) -> Result<(), NsError> {
        let root = self.containers.create_container()?;
        {
            let mut guard = root.write();
            if guard.id() != ROOT_ID {
                return Err(NsError::corrupted(format!(
                    "root allocated as #{}, the store has records but no root",
                    guard.id()
                )));
            }
            let now = Timespec::now();
            guard.set_parent_id(ROOT_ID);
            guard.set_name("/");
            guard.set_ctime(now);
            guard.set_mtime(now);
        }
        self.containers.update_store(&root)?;
        debug!("created root container");
        Ok(())
    }

    // Lookups

    /// Resolve as many elements of `path` as possible to containers,
    /// following symbolic links.
    ///
    /// Returns the deepest container reached and the index of the first
    /// element of `split_path(&abs_path(path))` that did not resolve; the
    /// index equals the element count when the whole path is a container.
    ///
    /// # Errors
    ///
    /// - [`NsError::TooManySymlinks`] after 255 link hops
    pub fn find_last_container(&self, path: &str) -> Result<(ContainerMdPtr, usize), NsError> {
        let _guard = self.namespace.read();
        self.state.ensure("find_last_container")?;
        let path = abs_path(path);
        self.resolve(&split_path(&path), &mut 0)
    }

    /// Look up the file at `path`. With `follow`, a terminal symbolic link
    /// is replaced by its target.
    ///
    /// # Errors
    ///
    /// - [`NsError::NotFound`] if the path does not resolve
    /// - [`NsError::NotAFile`] if it names a container
    /// - [`NsError::TooManySymlinks`] after 255 link hops
    pub fn get_file(&self, path: &str, follow: bool) -> Result<FileMdPtr, NsError> {
        let _guard = self.namespace.read();
        self.state.ensure("get_file")?;
        self.file_at(&abs_path(path), follow, &mut 0)
    }

    /// Look up the container at `path`, following symbolic links.
    ///
    /// # Errors
    ///
    /// - [`NsError::NotFound`] if the path does not resolve
    /// - [`NsError::NotADirectory`] if it names a file
    /// - [`NsError::TooManySymlinks`] after 255 link hops
    pub fn get_container(&self, path: &str) -> Result<ContainerMdPtr, NsError> {
        let _guard = self.namespace.read();
        self.state.ensure("get_container")?;
        self.container_at(&abs_path(path), &mut 0)
    }

    /// Sorted child names of the container at `path`.
    pub fn list(&self, path: &str) -> Result<Listing, NsError> {
        let _guard = self.namespace.read();
        self.state.ensure("list")?;
        let container = self.container_at(&abs_path(path), &mut 0)?;
        let guard = container.read();
        let mut listing = Listing {
            containers: guard.containers().map(|(name, _)| name.to_owned()).collect(),
            files: guard.files().map(|(name, _)| name.to_owned()).collect(),
        };
        listing.containers.sort_unstable();
        listing.files.sort_unstable();
        Ok(listing)
    }

    // Creation

    /// Create an empty file owned by `uid`:`gid`.
    ///
    /// # Errors
    ///
    /// - [`NsError::NotFound`] if the parent does not exist
    /// - [`NsError::AlreadyExists`] if a file or container has the name
    pub fn create_file(&self, path: &str, uid: u32, gid: u32) -> Result<FileMdPtr, NsError> {
        let _guard = self.namespace.write();
        self.state.ensure("create_file")?;
        self.create_file_entry(&abs_path(path), uid, gid, None)
    }

    /// Create a symbolic link at `path` pointing to `target`.
    ///
    /// Relative targets are resolved against the link's container when the
    /// link is followed.
    pub fn create_link(&self, path: &str, target: &str) -> Result<FileMdPtr, NsError> {
        if target.is_empty() {
            return Err(NsError::InvalidArgument {
                operation: "create_link",
                reason: "link target is empty".into(),
            });
        }
        let _guard = self.namespace.write();
        self.state.ensure("create_link")?;
        self.create_file_entry(&abs_path(path), 0, 0, Some(target))
    }

    /// Create the container at `path`.
    ///
    /// With `create_parents` every missing ancestor is created first, each
    /// one persisted before the next.
    ///
    /// # Errors
    ///
    /// - [`NsError::AlreadyExists`] if the container or a same-named file exists
    /// - [`NsError::NotFound`] if an ancestor is missing and `create_parents` is off
    pub fn create_container(
        &self,
        path: &str,
        create_parents: bool,
    ) -> Result<ContainerMdPtr, NsError> {
        let _guard = self.namespace.write();
        self.state.ensure("create_container")?;
        let path = abs_path(path);
        let elements = split_path(&path);
        let (mut current, consumed) = self.resolve(&elements, &mut 0)?;
        if consumed == elements.len() {
            return Err(NsError::AlreadyExists {
                path,
                operation: "create_container",
            });
        }
        if consumed + 1 < elements.len() && !create_parents {
            return Err(NsError::NotFound {
                path: join_prefix(&elements[..=consumed]),
            });
        }

        for name in &elements[consumed..] {
            self.ensure_free(&current, name, &path, "create_container")?;
            let parent_id = current.read().id();
            let container = self.containers.create_container()?;
            let id = {
                let mut guard = container.write();
                let now = Timespec::now();
                guard.set_parent_id(parent_id);
                guard.set_name(*name);
                guard.set_ctime(now);
                guard.set_mtime(now);
                guard.id()
            };
            self.containers.update_store(&container)?;
            {
                let mut guard = current.write();
                guard.add_container(*name, id);
                touch(&mut guard);
            }
            self.containers.update_store(&current)?;
            debug!(id, parent_id, name = *name, "created container");
            current = container;
        }
        Ok(current)
    }

    fn create_file_entry(
        &self,
        path: &str,
        uid: u32,
        gid: u32,
        link: Option<&str>,
    ) -> Result<FileMdPtr, NsError> {
        let elements = split_path(path);
        let Some((name, dirs)) = elements.split_last() else {
            return Err(NsError::AlreadyExists {
                path: path.to_owned(),
                operation: "create_file",
            });
        };
        let parent = self.parent_of(path, dirs, &mut 0)?;
        self.ensure_free(&parent, name, path, "create_file")?;

        let parent_id = parent.read().id();
        let file = self.files.create_file()?;
        let id = {
            let mut guard = file.write();
            let now = Timespec::now();
            guard.set_name(*name);
            guard.set_container_id(parent_id);
            guard.set_cuid(uid);
            guard.set_cgid(gid);
            guard.set_ctime(now);
            guard.set_mtime(now);
            guard.set_link(link.map(str::to_owned));
            guard.id()
        };
        {
            let mut guard = parent.write();
            guard.add_file(*name, id);
            touch(&mut guard);
        }
        self.files.update_store(&file)?;
        self.containers.update_store(&parent)?;
        debug!(id, parent_id, path, "created file");
        Ok(file)
    }

    // Removal

    /// Detach the file at `path` from its container and move its valid
    /// replicas to the unlinked list. The record stays until
    /// [`FileMdSvc::remove_file`] is called once every replica is gone.
    pub fn unlink_file(&self, path: &str) -> Result<FileMdPtr, NsError> {
        let _guard = self.namespace.write();
        self.state.ensure("unlink_file")?;
        let (parent, file) = self.file_entry(&abs_path(path))?;
        self.detach_file(&parent, &file);
        file.write().unlink_all_locations();
        self.files.update_store(&file)?;
        self.containers.update_store(&parent)?;
        Ok(file)
    }

    /// Detach and erase the file at `path`.
    ///
    /// # Errors
    ///
    /// - [`NsError::InvalidState`] while the file has valid or unlinked
    ///   replicas; the file stays in place
    pub fn remove_file(&self, path: &str) -> Result<(), NsError> {
        let _guard = self.namespace.write();
        self.state.ensure("remove_file")?;
        let (parent, file) = self.file_entry(&abs_path(path))?;
        check_file_removable(&file.read())?;
        self.erase_file(&parent, &file)
    }

    /// Detach and erase the symbolic link at `path` without touching its
    /// target.
    pub fn remove_link(&self, path: &str) -> Result<(), NsError> {
        let _guard = self.namespace.write();
        self.state.ensure("remove_link")?;
        let path = abs_path(path);
        let (parent, file) = self.file_entry(&path)?;
        if !file.read().is_link() {
            return Err(NsError::InvalidArgument {
                operation: "remove_link",
                reason: format!("{path} is not a symbolic link"),
            });
        }
        self.erase_file(&parent, &file)
    }

    /// Remove the container at `path`.
    ///
    /// With `recursive` every file and subcontainer below it is removed
    /// first, depth first, replica lists included.
    ///
    /// # Errors
    ///
    /// - [`NsError::PermissionDenied`] for the root
    /// - [`NsError::NotEmpty`] for a populated container without `recursive`
    pub fn remove_container(&self, path: &str, recursive: bool) -> Result<(), NsError> {
        let _guard = self.namespace.write();
        self.state.ensure("remove_container")?;
        let path = abs_path(path);
        let (parent, container, name) = self.container_entry(&path, "remove_container")?;

        if !container.read().is_empty() {
            if !recursive {
                return Err(NsError::NotEmpty { path });
            }
            self.clean_up(&container)?;
        }
        let (id, quota_node) = {
            let guard = container.read();
            (guard.id(), guard.is_quota_node())
        };
        self.containers.remove_container(id)?;
        {
            let mut guard = parent.write();
            guard.remove_container(&name);
            touch(&mut guard);
        }
        self.containers.update_store(&parent)?;
        if quota_node {
            self.drop_quota_node(id);
        }
        debug!(id, path = %path, recursive, "removed container");
        Ok(())
    }

    fn erase_file(&self, parent: &ContainerMdPtr, file: &FileMdPtr) -> Result<(), NsError> {
        let id = file.read().id();
        self.detach_file(parent, file);
        self.files.update_store(file)?;
        self.containers.update_store(parent)?;
        self.files.remove_file(id)?;
        debug!(id, "removed file");
        Ok(())
    }

    /// Depth-first removal of everything below `container`.
    fn clean_up(&self, container: &ContainerMdPtr) -> Result<(), NsError> {
        let (files, subcontainers) = {
            let guard = container.read();
            (
                collect_children(guard.files()),
                collect_children(guard.containers()),
            )
        };

        for (name, id) in files {
            match self.files.get_file_md(id) {
                Ok(file) => {
                    {
                        let mut guard = file.write();
                        guard.unlink_all_locations();
                        guard.remove_all_locations();
                    }
                    self.detach_file(container, &file);
                    self.files.update_store(&file)?;
                    self.files.remove_file(id)?;
                }
                Err(e) if e.is_not_found() => {
                    warn!(id, name = %name, "dropping dangling file entry");
                    container.write().remove_file(&name);
                }
                Err(e) => return Err(e),
            }
        }

        for (name, id) in subcontainers {
            match self.containers.get_container_md(id) {
                Ok(subcontainer) => {
                    self.clean_up(&subcontainer)?;
                    let quota_node = subcontainer.read().is_quota_node();
                    self.containers.remove_container(id)?;
                    if quota_node {
                        self.drop_quota_node(id);
                    }
                }
                Err(e) if e.is_not_found() => {
                    warn!(id, name = %name, "dropping dangling container entry");
                }
                Err(e) => return Err(e),
            }
            container.write().remove_container(&name);
        }
        self.containers.update_store(container)
    }

    // Renames and moves

    /// Rename the container at `path` within its parent.
    ///
    /// # Errors
    ///
    /// - [`NsError::InvalidArgument`] for an empty name or one containing `/`
    /// - [`NsError::PermissionDenied`] for the root
    /// - [`NsError::AlreadyExists`] if a sibling file or container has the name
    pub fn rename_container(&self, path: &str, new_name: &str) -> Result<(), NsError> {
        check_name("rename_container", new_name)?;
        let _guard = self.namespace.write();
        self.state.ensure("rename_container")?;
        let path = abs_path(path);
        let (parent, container, name) = self.container_entry(&path, "rename_container")?;
        if name == new_name {
            return Ok(());
        }
        let target = self.sibling_path(&parent, new_name)?;
        self.ensure_free(&parent, new_name, &target, "rename_container")?;

        let id = container.read().id();
        parent.write().remove_container(&name);
        container.write().set_name(new_name);
        {
            let mut guard = parent.write();
            guard.add_container(new_name, id);
            touch(&mut guard);
        }
        self.containers.update_store(&container)?;
        self.containers.update_store(&parent)?;
        debug!(id, from = %path, to = %target, "renamed container");
        Ok(())
    }

    /// Rename the file or link at `path` within its container.
    ///
    /// Fails like [`rename_container`](Self::rename_container) on a bad or
    /// colliding name.
    pub fn rename_file(&self, path: &str, new_name: &str) -> Result<(), NsError> {
        check_name("rename_file", new_name)?;
        let _guard = self.namespace.write();
        self.state.ensure("rename_file")?;
        let path = abs_path(path);
        let (parent, file) = self.file_entry(&path)?;
        let (id, name) = {
            let guard = file.read();
            (guard.id(), guard.name().to_owned())
        };
        if name == new_name {
            return Ok(());
        }
        let target = self.sibling_path(&parent, new_name)?;
        self.ensure_free(&parent, new_name, &target, "rename_file")?;

        parent.write().remove_file(&name);
        file.write().set_name(new_name);
        {
            let mut guard = parent.write();
            guard.add_file(new_name, id);
            touch(&mut guard);
        }
        self.files.update_store(&file)?;
        self.containers.update_store(&parent)?;
        debug!(id, from = %path, to = %target, "renamed file");
        Ok(())
    }

    /// Move the file at `path` into the container at `destination`, keeping
    /// its name. Tree sizes follow through `SizeChange` events.
    pub fn move_file(&self, path: &str, destination: &str) -> Result<(), NsError> {
        let _guard = self.namespace.write();
        self.state.ensure("move_file")?;
        let (parent, file) = self.file_entry(&abs_path(path))?;
        let target = self.container_at(&abs_path(destination), &mut 0)?;
        let parent_id = parent.read().id();
        let target_id = target.read().id();
        if parent_id == target_id {
            return Ok(());
        }
        let name = file.read().name().to_owned();
        let target_path = self.sibling_path(&target, &name)?;
        self.ensure_free(&target, &name, &target_path, "move_file")?;

        self.detach_file(&parent, &file);
        self.attach_file(&target, &file);
        self.files.update_store(&file)?;
        self.containers.update_store(&parent)?;
        self.containers.update_store(&target)?;
        Ok(())
    }

    /// Move the container at `path` below the container at `destination`,
    /// keeping its name.
    ///
    /// With accounting attached, the moved subtree's size is taken off the
    /// old ancestors and added to the new ones.
    ///
    /// # Errors
    ///
    /// - [`NsError::PermissionDenied`] for the root
    /// - [`NsError::InvalidArgument`] when `destination` lies inside the moved subtree
    /// - [`NsError::AlreadyExists`] on a name collision in `destination`
    pub fn move_container(&self, path: &str, destination: &str) -> Result<(), NsError> {
        let _guard = self.namespace.write();
        self.state.ensure("move_container")?;
        let path = abs_path(path);
        let (parent, container, name) = self.container_entry(&path, "move_container")?;
        let target = self.container_at(&abs_path(destination), &mut 0)?;

        let (id, tree_size) = {
            let guard = container.read();
            (guard.id(), guard.tree_size())
        };
        let parent_id = parent.read().id();
        let target_id = target.read().id();
        if self.is_within(id, &target)? {
            return Err(NsError::InvalidArgument {
                operation: "move_container",
                reason: format!("cannot move {path} into its own subtree"),
            });
        }
        if target_id == parent_id {
            return Ok(());
        }
        let target_path = self.sibling_path(&target, &name)?;
        self.ensure_free(&target, &name, &target_path, "move_container")?;

        {
            let mut guard = parent.write();
            guard.remove_container(&name);
            touch(&mut guard);
        }
        container.write().set_parent_id(target_id);
        {
            let mut guard = target.write();
            guard.add_container(name.as_str(), id);
            touch(&mut guard);
        }
        self.containers.update_store(&container)?;
        self.containers.update_store(&parent)?;
        self.containers.update_store(&target)?;
        if let Some(accounting) = &self.accounting {
            accounting.remove_tree(parent_id, tree_size);
            accounting.add_tree(target_id, tree_size);
        }
        debug!(id, from = %path, to = %target_path, "moved container");
        Ok(())
    }

    // Persistence passthrough

    /// Persist `file` through the file service. Does not take the
    /// namespace lock, so listeners may call it.
    pub fn update_file_store(&self, file: &FileMdPtr) -> Result<(), NsError> {
        self.files.update_store(file)
    }

    /// Persist `container` through the container service. Does not take
    /// the namespace lock.
    pub fn update_container_store(&self, container: &ContainerMdPtr) -> Result<(), NsError> {
        self.containers.update_store(container)
    }

    // Paths

    /// Absolute path of `container`, with a trailing `/`.
    pub fn get_uri(&self, container: &ContainerMdPtr) -> Result<String, NsError> {
        let _guard = self.namespace.read();
        self.state.ensure("get_uri")?;
        self.container_uri(container)
    }

    /// Absolute path of `file`.
    ///
    /// # Errors
    ///
    /// - [`NsError::InvalidState`] for a detached file
    pub fn get_file_uri(&self, file: &FileMdPtr) -> Result<String, NsError> {
        let _guard = self.namespace.read();
        self.state.ensure("get_file_uri")?;
        let (id, container_id, name) = {
            let guard = file.read();
            (guard.id(), guard.container_id(), guard.name().to_owned())
        };
        if container_id == DETACHED {
            return Err(NsError::InvalidState {
                operation: "get_file_uri",
                reason: format!("file #{id} is detached"),
            });
        }
        let container = self.containers.get_container_md(container_id)?;
        Ok(self.container_uri(&container)? + &name)
    }

    /// Rewrite the longest container prefix of `path` to its canonical
    /// location, following symbolic links, and append the unresolved rest
    /// unchanged.
    pub fn get_real_path(&self, path: &str) -> Result<String, NsError> {
        let _guard = self.namespace.read();
        self.state.ensure("get_real_path")?;
        let path = abs_path(path);
        let elements = split_path(&path);
        let (container, consumed) = self.resolve(&elements, &mut 0)?;
        let mut real = self.container_uri(&container)?;
        real.push_str(&elements[consumed..].join("/"));
        Ok(real)
    }

    // Quota

    /// Quota node accounting for `container`.
    ///
    /// Without `search` only a flagged container has a node. With `search`
    /// the nearest flagged ancestor answers, and the root stands in when no
    /// ancestor is flagged. Nodes are registered on first use. Returns
    /// `None` without a quota registry.
    pub fn get_quota_node(
        &self,
        container: &ContainerMdPtr,
        search: bool,
    ) -> Result<Option<Arc<dyn QuotaNode>>, NsError> {
        let _guard = self.namespace.read();
        self.state.ensure("get_quota_node")?;
        self.quota_node_of(container, search)
    }

    /// Flag `container` as a quota node and register its node.
    ///
    /// # Errors
    ///
    /// - [`NsError::AlreadyExists`] if the container is already flagged
    /// - [`NsError::InvalidState`] without a quota registry
    pub fn register_quota_node(
        &self,
        container: &ContainerMdPtr,
    ) -> Result<Arc<dyn QuotaNode>, NsError> {
        let _guard = self.namespace.write();
        self.state.ensure("register_quota_node")?;
        let Some(stats) = &self.quota else {
            return Err(NsError::InvalidState {
                operation: "register_quota_node",
                reason: "no quota registry attached".into(),
            });
        };
        let id = {
            let mut guard = container.write();
            if guard.is_quota_node() {
                return Err(NsError::AlreadyExists {
                    path: format!("quota node #{}", guard.id()),
                    operation: "register_quota_node",
                });
            }
            let flags = guard.flags() | QUOTA_NODE_FLAG;
            guard.set_flags(flags);
            guard.id()
        };
        self.containers.update_store(container)?;
        debug!(id, "registered quota node");
        node_for(stats.as_ref(), id)
    }

    /// Clear the quota flag of `container` and meld its usage into the
    /// nearest remaining ancestor node. The root's node is kept since it
    /// is the fallback for every search.
    ///
    /// # Errors
    ///
    /// - [`NsError::NotFound`] if the container is not flagged
    pub fn remove_quota_node(&self, container: &ContainerMdPtr) -> Result<(), NsError> {
        let _guard = self.namespace.write();
        self.state.ensure("remove_quota_node")?;
        let (id, parent_id, root) = {
            let mut guard = container.write();
            if !guard.is_quota_node() {
                return Err(NsError::NotFound {
                    path: format!("quota node #{}", guard.id()),
                });
            }
            let flags = guard.flags() & !QUOTA_NODE_FLAG;
            guard.set_flags(flags);
            (guard.id(), guard.parent_id(), guard.is_root())
        };
        self.containers.update_store(container)?;

        let Some(stats) = &self.quota else {
            return Ok(());
        };
        if root {
            return Ok(());
        }
        if let Some(node) = stats.get_quota_node(id) {
            let parent = self.containers.get_container_md(parent_id)?;
            if let Some(ancestor) = self.quota_node_of(&parent, true)? {
                ancestor.meld(node.as_ref());
                debug!(id, into = ancestor.container_id(), "melded quota node");
            }
            stats.remove_node(id);
        }
        Ok(())
    }

    fn quota_node_of(
        &self,
        container: &ContainerMdPtr,
        search: bool,
    ) -> Result<Option<Arc<dyn QuotaNode>>, NsError> {
        let Some(stats) = &self.quota else {
            return Ok(None);
        };
        let mut current = container.clone();
        for _ in 0..MAX_TREE_DEPTH {
            let (id, parent_id, flagged, root) = {
                let guard = current.read();
                (guard.id(), guard.parent_id(), guard.is_quota_node(), guard.is_root())
            };
            if flagged || (search && root) {
                return node_for(stats.as_ref(), id).map(Some);
            }
            if !search {
                return Ok(None);
            }
            current = self.containers.get_container_md(parent_id)?;
        }
        Err(NsError::corrupted(
            "quota node search did not reach the root".to_string(),
        ))
    }

    fn drop_quota_node(&self, id: ContainerId) {
        if let Some(stats) = &self.quota {
            stats.remove_node(id);
        }
    }

    // Resolution helpers, namespace lock held

    fn root(&self) -> Result<ContainerMdPtr, NsError> {
        self.containers.get_container_md(ROOT_ID)
    }

    /// Walk `elements` from the root. On a miss, a symbolic link of that
    /// name whose target resolves to a container continues the walk.
    fn resolve(
        &self,
        elements: &[&str],
        hops: &mut usize,
    ) -> Result<(ContainerMdPtr, usize), NsError> {
        let mut current = self.root()?;
        let mut index = 0;
        while let Some(name) = elements.get(index) {
            if let Some(next) = self.child_container(&current, name)? {
                current = next;
                index += 1;
                continue;
            }
            let Some(target) = self.link_target(&current, name)? else {
                break;
            };
            let target_path = self.link_path(&current, &target)?;
            hop(hops, &target_path)?;
            let target_elements = split_path(&target_path);
            let (resolved, consumed) = self.resolve(&target_elements, hops)?;
            if consumed < target_elements.len() {
                break;
            }
            current = resolved;
            index += 1;
        }
        Ok((current, index))
    }

    /// Container holding the last element of `path`, which must resolve
    /// completely.
    fn parent_of(
        &self,
        path: &str,
        dirs: &[&str],
        hops: &mut usize,
    ) -> Result<ContainerMdPtr, NsError> {
        let (parent, consumed) = self.resolve(dirs, hops)?;
        let Some(name) = dirs.get(consumed) else {
            return Ok(parent);
        };
        match self.not_a_container(&parent, name, &join_prefix(&dirs[..=consumed]))? {
            NsError::NotFound { .. } => Err(NsError::NotFound {
                path: path.to_owned(),
            }),
            other => Err(other),
        }
    }

    fn file_at(&self, path: &str, follow: bool, hops: &mut usize) -> Result<FileMdPtr, NsError> {
        let elements = split_path(path);
        let Some((name, dirs)) = elements.split_last() else {
            return Err(NsError::NotAFile {
                path: path.to_owned(),
            });
        };
        let parent = self.parent_of(path, dirs, hops)?;
        let Some(file) = self.child_file(&parent, name)? else {
            if self.child_container(&parent, name)?.is_some() {
                return Err(NsError::NotAFile {
                    path: path.to_owned(),
                });
            }
            return Err(NsError::NotFound {
                path: path.to_owned(),
            });
        };
        if follow {
            let target = file.read().link().map(str::to_owned);
            if let Some(target) = target {
                let target_path = self.link_path(&parent, &target)?;
                hop(hops, &target_path)?;
                return self.file_at(&target_path, true, hops);
            }
        }
        Ok(file)
    }

    fn container_at(&self, path: &str, hops: &mut usize) -> Result<ContainerMdPtr, NsError> {
        let elements = split_path(path);
        let (container, consumed) = self.resolve(&elements, hops)?;
        match elements.get(consumed) {
            None => Ok(container),
            Some(name) => Err(self.not_a_container(
                &container,
                name,
                &join_prefix(&elements[..=consumed]),
            )?),
        }
    }

    /// Parent and file at `path` without following a terminal link.
    fn file_entry(&self, path: &str) -> Result<(ContainerMdPtr, FileMdPtr), NsError> {
        let elements = split_path(path);
        let Some((name, dirs)) = elements.split_last() else {
            return Err(NsError::NotAFile {
                path: path.to_owned(),
            });
        };
        let parent = self.parent_of(path, dirs, &mut 0)?;
        if let Some(file) = self.child_file(&parent, name)? {
            return Ok((parent, file));
        }
        if self.child_container(&parent, name)?.is_some() {
            return Err(NsError::NotAFile {
                path: path.to_owned(),
            });
        }
        Err(NsError::NotFound {
            path: path.to_owned(),
        })
    }

    /// Parent, container and name at `path` without following a terminal
    /// link. The root is refused.
    fn container_entry(
        &self,
        path: &str,
        operation: &'static str,
    ) -> Result<(ContainerMdPtr, ContainerMdPtr, String), NsError> {
        let elements = split_path(path);
        let Some((name, dirs)) = elements.split_last() else {
            return Err(NsError::PermissionDenied {
                path: path.to_owned(),
                operation,
            });
        };
        let parent = self.parent_of(path, dirs, &mut 0)?;
        match self.child_container(&parent, name)? {
            Some(container) if container.read().is_root() => Err(NsError::PermissionDenied {
                path: path.to_owned(),
                operation,
            }),
            Some(container) => Ok((parent, container, (*name).to_owned())),
            None => Err(self.not_a_container(&parent, name, path)?),
        }
    }

    /// The error for a name that is not a container of `parent`.
    fn not_a_container(
        &self,
        parent: &ContainerMdPtr,
        name: &str,
        path: &str,
    ) -> Result<NsError, NsError> {
        let path = path.to_owned();
        Ok(match self.child_file(parent, name)? {
            Some(file) if !file.read().is_link() => NsError::NotADirectory { path },
            _ => NsError::NotFound { path },
        })
    }

    fn child_container(
        &self,
        parent: &ContainerMdPtr,
        name: &str,
    ) -> Result<Option<ContainerMdPtr>, NsError> {
        let id = parent.read().find_container(name);
        let Some(id) = id else {
            return Ok(None);
        };
        match self.containers.get_container_md(id) {
            Ok(container) => Ok(Some(container)),
            Err(e) if e.is_not_found() => {
                warn!(id, name, "dangling container entry");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn child_file(
        &self,
        parent: &ContainerMdPtr,
        name: &str,
    ) -> Result<Option<FileMdPtr>, NsError> {
        let id = parent.read().find_file(name);
        let Some(id) = id else {
            return Ok(None);
        };
        match self.files.get_file_md(id) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.is_not_found() => {
                warn!(id, name, "dangling file entry");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn link_target(&self, parent: &ContainerMdPtr, name: &str) -> Result<Option<String>, NsError> {
        let Some(file) = self.child_file(parent, name)? else {
            return Ok(None);
        };
        let target = file.read().link().map(str::to_owned);
        Ok(target)
    }

    /// Absolute, normalized form of a link target found in `container`.
    fn link_path(&self, container: &ContainerMdPtr, target: &str) -> Result<String, NsError> {
        if target.starts_with('/') {
            return Ok(abs_path(target));
        }
        Ok(abs_path(&(self.container_uri(container)? + target)))
    }

    fn ensure_free(
        &self,
        parent: &ContainerMdPtr,
        name: &str,
        path: &str,
        operation: &'static str,
    ) -> Result<(), NsError> {
        if self.child_file(parent, name)?.is_some() || self.child_container(parent, name)?.is_some()
        {
            return Err(NsError::AlreadyExists {
                path: path.to_owned(),
                operation,
            });
        }
        Ok(())
    }

    fn sibling_path(&self, parent: &ContainerMdPtr, name: &str) -> Result<String, NsError> {
        Ok(self.container_uri(parent)? + name)
    }

    /// Returns `true` if `ancestor` is `container` or one of its ancestors.
    fn is_within(&self, ancestor: ContainerId, container: &ContainerMdPtr) -> Result<bool, NsError> {
        let mut current = container.clone();
        for _ in 0..MAX_TREE_DEPTH {
            let (id, parent_id, root) = {
                let guard = current.read();
                (guard.id(), guard.parent_id(), guard.is_root())
            };
            if id == ancestor {
                return Ok(true);
            }
            if root || parent_id == DETACHED {
                return Ok(false);
            }
            current = self.containers.get_container_md(parent_id)?;
        }
        Err(NsError::corrupted(format!(
            "container #{} has no path to the root",
            container.read().id()
        )))
    }

    fn container_uri(&self, container: &ContainerMdPtr) -> Result<String, NsError> {
        let mut names = Vec::new();
        let mut current = container.clone();
        for _ in 0..=MAX_TREE_DEPTH {
            let (id, parent_id, root) = {
                let guard = current.read();
                if !guard.is_root() {
                    names.push(guard.name().to_owned());
                }
                (guard.id(), guard.parent_id(), guard.is_root())
            };
            if root {
                let mut uri = String::from("/");
                for name in names.iter().rev() {
                    uri.push_str(name);
                    uri.push('/');
                }
                return Ok(uri);
            }
            if parent_id == DETACHED {
                return Err(NsError::InvalidState {
                    operation: "get_uri",
                    reason: format!("container #{id} is detached"),
                });
            }
            current = self.containers.get_container_md(parent_id)?;
        }
        Err(NsError::corrupted(format!(
            "container #{} has no path to the root",
            container.read().id()
        )))
    }

    // Attachment, namespace lock held. Neither persists anything.

    fn detach_file(&self, parent: &ContainerMdPtr, file: &FileMdPtr) {
        let (id, name, size) = {
            let guard = file.read();
            (guard.id(), guard.name().to_owned(), guard.size())
        };
        let parent_id = {
            let mut guard = parent.write();
            guard.remove_file(&name);
            touch(&mut guard);
            guard.id()
        };
        file.write().set_container_id(DETACHED);
        self.publish_size(id, parent_id, -signed(size));
    }

    fn attach_file(&self, parent: &ContainerMdPtr, file: &FileMdPtr) {
        let parent_id = parent.read().id();
        let (id, name, size) = {
            let mut guard = file.write();
            guard.set_container_id(parent_id);
            (guard.id(), guard.name().to_owned(), guard.size())
        };
        {
            let mut guard = parent.write();
            guard.add_file(name, id);
            touch(&mut guard);
        }
        self.publish_size(id, parent_id, signed(size));
    }

    fn publish_size(&self, file_id: FileId, container_id: ContainerId, delta: i64) {
        if delta != 0 {
            self.files.notify_listeners(&FileMdEvent::new(
                file_id,
                container_id,
                FileChange::SizeChange(delta),
            ));
        }
    }
}

impl std::fmt::Debug for HierarchicalView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HierarchicalView")
            .field("quota", &self.quota.is_some())
            .field("accounting", &self.accounting.is_some())
            .finish_non_exhaustive()
    }
}

fn touch(container: &mut ContainerMd) {
    container.set_mtime_now();
    container.notify_mtime_change();
}

fn hop(hops: &mut usize, path: &str) -> Result<(), NsError> {
    *hops += 1;
    if *hops > MAX_SYMLINK_DEPTH {
        return Err(NsError::TooManySymlinks {
            path: path.to_owned(),
        });
    }
    Ok(())
}

fn node_for(stats: &dyn QuotaStats, id: ContainerId) -> Result<Arc<dyn QuotaNode>, NsError> {
    match stats.get_quota_node(id) {
        Some(node) => Ok(node),
        None => stats.register_new_node(id),
    }
}

fn join_prefix(elements: &[&str]) -> String {
    format!("/{}", elements.join("/"))
}

fn collect_children<'a>(children: impl Iterator<Item = (&'a str, u64)>) -> Vec<(String, u64)> {
    children.map(|(name, id)| (name.to_owned(), id)).collect()
}

fn signed(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}
