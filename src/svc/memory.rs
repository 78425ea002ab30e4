//! In-memory services with optional changelog persistence.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::changelog::{Changelog, LogRecord};
use super::{
    Lifecycle, check_container_removable, check_file_removable, container_events, file_events,
};
use crate::codec::{BinaryCodec, Codec};
use crate::config::{CHANGELOG_PATH, Options};
use crate::error::EntityKind;
use crate::md::{ContainerMd, ContainerMdPtr, FileMd, FileMdPtr};
use crate::traits::{
    ContainerChange, ContainerMdChangeListener, ContainerMdEvent, ContainerMdSvc, FileChange,
    FileMdChangeListener, FileMdEvent, FileMdSvc, ListenerRegistry,
};
use crate::types::{ContainerId, DETACHED, FileId};
use crate::NsError;

/// Open the configured changelog, if any.
fn open_changelog(
    path: &RwLock<Option<PathBuf>>,
) -> Result<(Option<Changelog>, Vec<LogRecord>), NsError> {
    match path.read().as_ref() {
        Some(path) => {
            let (log, records) = Changelog::open(path)?;
            Ok((Some(log), records))
        }
        None => Ok((None, Vec::new())),
    }
}

fn configure_changelog(
    state: &Lifecycle,
    slot: &RwLock<Option<PathBuf>>,
    options: &HashMap<String, String>,
) -> Result<(), NsError> {
    state.ensure_not("configure")?;
    *slot.write() = Options::new(options).get_str(CHANGELOG_PATH).map(PathBuf::from);
    Ok(())
}

// ============================================================================
// Containers
// ============================================================================

/// Container service keeping every container in a hash map.
///
/// With `changelog_path` configured, each `update_store` appends the
/// container's binary record and each removal a delete record; the log is
/// replayed on `initialize` and the child maps are rebuilt from the parent
/// ids it holds.
///
/// ```rust
/// use namespace_md::{ContainerMdSvc, InMemoryContainerMdSvc};
///
/// let svc = InMemoryContainerMdSvc::new();
/// svc.initialize().unwrap();
/// let root = svc.create_container().unwrap();
/// assert_eq!(root.read().id(), 1);
/// ```
pub struct InMemoryContainerMdSvc {
    containers: RwLock<HashMap<ContainerId, ContainerMdPtr>>,
    next_id: AtomicU64,
    state: Lifecycle,
    changelog_path: RwLock<Option<PathBuf>>,
    changelog: RwLock<Option<Changelog>>,
    listeners: ListenerRegistry<dyn ContainerMdChangeListener>,
}

impl InMemoryContainerMdSvc {
    /// Create an unconfigured service.
    pub fn new() -> Self {
        Self {
            containers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            state: Lifecycle::default(),
            changelog_path: RwLock::new(None),
            changelog: RwLock::new(None),
            listeners: ListenerRegistry::new(),
        }
    }

    /// Rebuild the container map. Also returns the highest id the log ever
    /// mentioned so erased ids are not handed out again.
    fn replay(
        records: Vec<LogRecord>,
    ) -> Result<(HashMap<ContainerId, ContainerMd>, ContainerId), NsError> {
        let mut map = HashMap::new();
        let mut max_id = 0;
        for record in records {
            match record {
                LogRecord::Update(bytes) => {
                    let container = BinaryCodec.decode_container(&bytes)?;
                    max_id = max_id.max(container.id());
                    map.insert(container.id(), container);
                }
                LogRecord::Delete(id) => {
                    max_id = max_id.max(id);
                    map.remove(&id);
                }
            }
        }

        let edges: Vec<_> = map
            .values()
            .filter(|c| !c.is_root() && c.parent_id() != DETACHED)
            .map(|c| (c.parent_id(), c.name().to_string(), c.id()))
            .collect();
        for (parent_id, name, id) in edges {
            match map.get_mut(&parent_id) {
                Some(parent) => parent.add_container(name, id),
                None => warn!(id, parent_id, "replayed container has no parent"),
            }
        }
        for container in map.values_mut() {
            container.take_child_deltas();
        }
        Ok((map, max_id))
    }
}

impl Default for InMemoryContainerMdSvc {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerMdSvc for InMemoryContainerMdSvc {
    fn configure(&self, options: &HashMap<String, String>) -> Result<(), NsError> {
        configure_changelog(&self.state, &self.changelog_path, options)
    }

    fn initialize(&self) -> Result<(), NsError> {
        self.state.ensure_not("initialize")?;
        let (log, records) = open_changelog(&self.changelog_path)?;
        let replayed = records.len();
        let (map, max_id) = Self::replay(records)?;
        self.next_id.store(max_id + 1, Ordering::SeqCst);
        *self.containers.write() = map
            .into_iter()
            .map(|(id, c)| (id, Arc::new(RwLock::new(c))))
            .collect();
        *self.changelog.write() = log;
        self.state.set(true);

        info!(
            containers = self.containers.read().len(),
            replayed, "container service initialized"
        );
        Ok(())
    }

    fn finalize(&self) -> Result<(), NsError> {
        if let Some(log) = self.changelog.write().take() {
            log.sync()?;
        }
        self.containers.write().clear();
        self.state.set(false);
        debug!("container service finalized");
        Ok(())
    }

    fn create_container(&self) -> Result<ContainerMdPtr, NsError> {
        self.state.ensure("create_container")?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let container = Arc::new(RwLock::new(ContainerMd::new(id)));
        self.containers.write().insert(id, container.clone());
        self.listeners
            .dispatch(&ContainerMdEvent::new(id, DETACHED, ContainerChange::Created));
        Ok(container)
    }

    fn get_container_md(&self, id: ContainerId) -> Result<ContainerMdPtr, NsError> {
        self.state.ensure("get_container_md")?;
        self.containers
            .read()
            .get(&id)
            .cloned()
            .ok_or(NsError::IdNotFound {
                kind: EntityKind::Container,
                id,
            })
    }

    fn update_store(&self, container: &ContainerMdPtr) -> Result<(), NsError> {
        self.state.ensure("update_store")?;
        let (id, events) = {
            let mut guard = container.write();
            if let Some(log) = self.changelog.read().as_ref() {
                log.append_update(&BinaryCodec.encode_container(&guard)?)?;
            }
            guard.take_child_deltas();
            (guard.id(), container_events(&mut guard))
        };
        self.containers.write().insert(id, container.clone());
        for event in &events {
            self.listeners.dispatch(event);
        }
        Ok(())
    }

    fn remove_container(&self, id: ContainerId) -> Result<(), NsError> {
        self.state.ensure("remove_container")?;
        let Some(container) = self.containers.read().get(&id).cloned() else {
            return Ok(());
        };
        let parent_id = {
            let guard = container.read();
            check_container_removable(&guard)?;
            guard.parent_id()
        };
        if let Some(log) = self.changelog.read().as_ref() {
            log.append_delete(id)?;
        }
        self.containers.write().remove(&id);
        self.listeners
            .dispatch(&ContainerMdEvent::new(id, parent_id, ContainerChange::Deleted));
        Ok(())
    }

    fn num_containers(&self) -> Result<u64, NsError> {
        self.state.ensure("num_containers")?;
        Ok(self.containers.read().len() as u64)
    }

    fn persists_tree_size(&self) -> bool {
        false
    }

    fn add_change_listener(&self, listener: Arc<dyn ContainerMdChangeListener>) {
        self.listeners.add(listener);
    }

    fn notify_listeners(&self, event: &ContainerMdEvent) {
        self.listeners.dispatch(event);
    }
}

// ============================================================================
// Files
// ============================================================================

/// File service keeping every file in a hash map.
///
/// On replay each file is re-attached to its container through the
/// container service given to [`FileMdSvc::set_container_service`], and a
/// `SizeChange` event is published for every attached non-empty file so
/// accounting listeners can rebuild tree sizes.
pub struct InMemoryFileMdSvc {
    files: RwLock<HashMap<FileId, FileMdPtr>>,
    next_id: AtomicU64,
    state: Lifecycle,
    changelog_path: RwLock<Option<PathBuf>>,
    changelog: RwLock<Option<Changelog>>,
    containers: RwLock<Option<Arc<dyn ContainerMdSvc>>>,
    listeners: ListenerRegistry<dyn FileMdChangeListener>,
}

impl InMemoryFileMdSvc {
    /// Create an unconfigured service.
    pub fn new() -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            state: Lifecycle::default(),
            changelog_path: RwLock::new(None),
            changelog: RwLock::new(None),
            containers: RwLock::new(None),
            listeners: ListenerRegistry::new(),
        }
    }

    fn replay(records: Vec<LogRecord>) -> Result<(HashMap<FileId, FileMd>, FileId), NsError> {
        let mut map = HashMap::new();
        let mut max_id = 0;
        for record in records {
            match record {
                LogRecord::Update(bytes) => {
                    let file = BinaryCodec.decode_file(&bytes)?;
                    max_id = max_id.max(file.id());
                    map.insert(file.id(), file);
                }
                LogRecord::Delete(id) => {
                    max_id = max_id.max(id);
                    map.remove(&id);
                }
            }
        }
        Ok((map, max_id))
    }

    /// Link replayed files into their containers. Returns the size events to
    /// publish once the service is live.
    fn attach(&self, map: &mut HashMap<FileId, FileMd>) -> Result<Vec<FileMdEvent>, NsError> {
        let Some(containers) = self.containers.read().clone() else {
            if !map.is_empty() {
                warn!("no container service set, replayed files stay detached");
            }
            return Ok(Vec::new());
        };

        let mut events = Vec::new();
        for file in map.values_mut() {
            let container_id = file.container_id();
            if container_id == DETACHED {
                continue;
            }
            match containers.get_container_md(container_id) {
                Ok(container) => {
                    let mut guard = container.write();
                    guard.add_file(file.name(), file.id());
                    guard.take_child_deltas();
                    if file.size() > 0 {
                        events.push(FileMdEvent::new(
                            file.id(),
                            container_id,
                            FileChange::SizeChange(file.size() as i64),
                        ));
                    }
                }
                Err(e) if e.is_not_found() => {
                    warn!(
                        file_id = file.id(),
                        container_id, "replayed file has no container, detaching"
                    );
                    file.set_container_id(DETACHED);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(events)
    }
}

impl Default for InMemoryFileMdSvc {
    fn default() -> Self {
        Self::new()
    }
}

impl FileMdSvc for InMemoryFileMdSvc {
    fn configure(&self, options: &HashMap<String, String>) -> Result<(), NsError> {
        configure_changelog(&self.state, &self.changelog_path, options)
    }

    fn initialize(&self) -> Result<(), NsError> {
        self.state.ensure_not("initialize")?;
        let (log, records) = open_changelog(&self.changelog_path)?;
        let replayed = records.len();
        let (mut map, max_id) = Self::replay(records)?;
        let events = self.attach(&mut map)?;
        self.next_id.store(max_id + 1, Ordering::SeqCst);
        *self.files.write() = map
            .into_iter()
            .map(|(id, f)| (id, Arc::new(RwLock::new(f))))
            .collect();
        *self.changelog.write() = log;
        self.state.set(true);

        for event in &events {
            self.listeners.dispatch(event);
        }
        info!(
            files = self.files.read().len(),
            replayed, "file service initialized"
        );
        Ok(())
    }

    fn finalize(&self) -> Result<(), NsError> {
        if let Some(log) = self.changelog.write().take() {
            log.sync()?;
        }
        self.files.write().clear();
        self.state.set(false);
        debug!("file service finalized");
        Ok(())
    }

    fn set_container_service(&self, svc: Arc<dyn ContainerMdSvc>) {
        *self.containers.write() = Some(svc);
    }

    fn create_file(&self) -> Result<FileMdPtr, NsError> {
        self.state.ensure("create_file")?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let file = Arc::new(RwLock::new(FileMd::new(id)));
        self.files.write().insert(id, file.clone());
        self.listeners
            .dispatch(&FileMdEvent::new(id, DETACHED, FileChange::Created));
        Ok(file)
    }

    fn get_file_md(&self, id: FileId) -> Result<FileMdPtr, NsError> {
        self.state.ensure("get_file_md")?;
        self.files
            .read()
            .get(&id)
            .cloned()
            .ok_or(NsError::IdNotFound {
                kind: EntityKind::File,
                id,
            })
    }

    fn update_store(&self, file: &FileMdPtr) -> Result<(), NsError> {
        self.state.ensure("update_store")?;
        let (id, events) = {
            let mut guard = file.write();
            if let Some(log) = self.changelog.read().as_ref() {
                log.append_update(&BinaryCodec.encode_file(&guard)?)?;
            }
            (guard.id(), file_events(&mut guard))
        };
        self.files.write().insert(id, file.clone());
        for event in &events {
            self.listeners.dispatch(event);
        }
        Ok(())
    }

    fn remove_file(&self, id: FileId) -> Result<(), NsError> {
        self.state.ensure("remove_file")?;
        let Some(file) = self.files.read().get(&id).cloned() else {
            return Ok(());
        };
        let container_id = {
            let guard = file.read();
            check_file_removable(&guard)?;
            guard.container_id()
        };
        if let Some(log) = self.changelog.read().as_ref() {
            log.append_delete(id)?;
        }
        self.files.write().remove(&id);
        self.listeners
            .dispatch(&FileMdEvent::new(id, container_id, FileChange::Deleted));
        Ok(())
    }

    fn num_files(&self) -> Result<u64, NsError> {
        self.state.ensure("num_files")?;
        Ok(self.files.read().len() as u64)
    }

    fn add_change_listener(&self, listener: Arc<dyn FileMdChangeListener>) {
        self.listeners.add(listener);
    }

    fn notify_listeners(&self, event: &FileMdEvent) {
        self.listeners.dispatch(event);
    }
}
