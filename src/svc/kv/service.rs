//! Metadata services over a [`KvStore`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use super::{KvOp, KvStore, SqliteKvStore, decode_u64, encode_u64, keys};
use crate::codec::{BinaryCodec, Codec};
use crate::config::{CACHE_SIZE, DEFAULT_CACHE_SIZE, Options, SQLITE_PATH};
use crate::error::EntityKind;
use crate::md::{ChildDelta, ContainerMd, ContainerMdPtr, FileMd, FileMdPtr};
use crate::svc::{
    Lifecycle, check_container_removable, check_file_removable, container_events, file_events,
};
use crate::traits::{
    ContainerChange, ContainerMdChangeListener, ContainerMdEvent, ContainerMdSvc, FileChange,
    FileMdChangeListener, FileMdEvent, FileMdSvc, ListenerRegistry,
};
use crate::types::{ContainerId, DETACHED, FileId};
use crate::NsError;

// ============================================================================
// Shared plumbing
// ============================================================================

/// Entity cache with a soft capacity. Only handles nobody else holds are
/// evicted.
struct EntityCache<T> {
    entries: DashMap<u64, Arc<RwLock<T>>>,
    capacity: AtomicUsize,
}

impl<T> EntityCache<T> {
    fn new() -> Self {
        Self {
            entries: DashMap::new(),
            capacity: AtomicUsize::new(DEFAULT_CACHE_SIZE as usize),
        }
    }

    fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity.max(1), Ordering::Relaxed);
    }

    fn get(&self, id: u64) -> Option<Arc<RwLock<T>>> {
        self.entries.get(&id).map(|entry| entry.value().clone())
    }

    /// Insert unless another thread got there first; returns the cached handle.
    fn insert(&self, id: u64, entity: Arc<RwLock<T>>) -> Arc<RwLock<T>> {
        let cached = self.entries.entry(id).or_insert(entity).value().clone();
        self.evict(id);
        cached
    }

    fn put(&self, id: u64, entity: Arc<RwLock<T>>) {
        self.entries.insert(id, entity);
        self.evict(id);
    }

    fn remove(&self, id: u64) {
        self.entries.remove(&id);
    }

    fn clear(&self) {
        self.entries.clear();
    }

    fn evict(&self, keep: u64) {
        let capacity = self.capacity.load(Ordering::Relaxed);
        let len = self.entries.len();
        if len <= capacity {
            return;
        }
        let victims: Vec<u64> = self
            .entries
            .iter()
            .filter(|entry| *entry.key() != keep && Arc::strong_count(entry.value()) == 1)
            .map(|entry| *entry.key())
            .take(len - capacity)
            .collect();
        for id in victims {
            self.entries
                .remove_if(&id, |_, entity| Arc::strong_count(entity) == 1);
        }
    }
}

/// Store handle plus the options used to open one when none was injected.
struct StoreSlot {
    store: RwLock<Option<Arc<dyn KvStore>>>,
    owned: AtomicBool,
    sqlite_path: RwLock<Option<PathBuf>>,
}

impl StoreSlot {
    fn new(store: Option<Arc<dyn KvStore>>) -> Self {
        Self {
            store: RwLock::new(store),
            owned: AtomicBool::new(false),
            sqlite_path: RwLock::new(None),
        }
    }

    fn configure<T>(
        &self,
        cache: &EntityCache<T>,
        options: &HashMap<String, String>,
    ) -> Result<(), NsError> {
        let options = Options::new(options);
        if let Some(path) = options.get_str(SQLITE_PATH) {
            *self.sqlite_path.write() = Some(PathBuf::from(path));
        }
        let capacity = options.get_u64(CACHE_SIZE, DEFAULT_CACHE_SIZE)?;
        cache.set_capacity(usize::try_from(capacity).unwrap_or(usize::MAX));
        Ok(())
    }

    fn connect(&self) -> Result<Arc<dyn KvStore>, NsError> {
        if let Some(store) = self.store.read().clone() {
            return Ok(store);
        }
        let path = self
            .sqlite_path
            .read()
            .clone()
            .ok_or_else(|| NsError::InvalidConfig {
                key: SQLITE_PATH.into(),
                reason: "required when no store is attached".into(),
            })?;
        let store: Arc<dyn KvStore> = Arc::new(SqliteKvStore::open(&path)?);
        *self.store.write() = Some(store.clone());
        self.owned.store(true, Ordering::SeqCst);
        Ok(store)
    }

    fn get(&self, operation: &'static str) -> Result<Arc<dyn KvStore>, NsError> {
        self.store
            .read()
            .clone()
            .ok_or_else(|| NsError::uninitialized(operation))
    }

    fn release(&self) {
        if self.owned.swap(false, Ordering::SeqCst) {
            *self.store.write() = None;
        }
    }
}

/// Reserve the next id and persist the counter before handing it out.
fn allocate_id(
    counter: &Mutex<u64>,
    store: &dyn KvStore,
    key: &'static str,
) -> Result<u64, NsError> {
    let mut next = counter.lock();
    let id = *next;
    store.apply(&[KvOp::Set {
        key: key.into(),
        value: encode_u64(id + 1),
    }])?;
    *next = id + 1;
    Ok(id)
}

fn load_counter(store: &dyn KvStore, key: &str) -> Result<u64, NsError> {
    match store.get(key)? {
        Some(raw) => decode_u64(&raw),
        None => Ok(1),
    }
}

fn child_map(entries: Vec<(String, Vec<u8>)>) -> Result<HashMap<String, u64>, NsError> {
    entries
        .into_iter()
        .map(|(name, raw)| Ok((name, decode_u64(&raw)?)))
        .collect()
}

fn child_ops(id: ContainerId, delta: &ChildDelta) -> Vec<KvOp> {
    match delta.clone() {
        ChildDelta::AddContainer { name, id: child } => vec![KvOp::HSet {
            key: keys::subcontainers(id),
            field: name,
            value: encode_u64(child),
        }],
        ChildDelta::RemoveContainer { name } => vec![KvOp::HDel {
            key: keys::subcontainers(id),
            field: name,
        }],
        ChildDelta::AddFile { name, id: child } => vec![KvOp::HSet {
            key: keys::files(id),
            field: name,
            value: encode_u64(child),
        }],
        ChildDelta::RemoveFile { name } => vec![KvOp::HDel {
            key: keys::files(id),
            field: name,
        }],
        ChildDelta::Clear => vec![
            KvOp::HClear {
                key: keys::subcontainers(id),
            },
            KvOp::HClear {
                key: keys::files(id),
            },
        ],
    }
}

// ============================================================================
// Containers
// ============================================================================

/// Container service over a [`KvStore`], records encoded with `C`.
///
/// With [`BinaryCodec`] the child maps and `tree_size` live in side hashes
/// updated from the container's child-delta journal; with a self-contained
/// codec (JSON documents) they travel inside the record.
///
/// ```rust
/// use std::sync::Arc;
/// use namespace_md::{ContainerMdSvc, KvContainerMdSvc, MemoryKvStore};
///
/// let svc = KvContainerMdSvc::<namespace_md::BinaryCodec>::new()
///     .with_store(Arc::new(MemoryKvStore::new()));
/// svc.initialize().unwrap();
/// let root = svc.create_container().unwrap();
/// svc.update_store(&root).unwrap();
/// assert_eq!(svc.num_containers().unwrap(), 1);
/// ```
pub struct KvContainerMdSvc<C = BinaryCodec> {
    codec: C,
    slot: StoreSlot,
    cache: EntityCache<ContainerMd>,
    next_id: Mutex<u64>,
    state: Lifecycle,
    listeners: ListenerRegistry<dyn ContainerMdChangeListener>,
}

impl<C: Codec + Default> KvContainerMdSvc<C> {
    /// Create a service with the default codec and no store attached.
    pub fn new() -> Self {
        Self::with_codec(C::default())
    }
}

impl<C: Codec + Default> Default for KvContainerMdSvc<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Codec> KvContainerMdSvc<C> {
    /// Create a service encoding records with `codec`.
    pub fn with_codec(codec: C) -> Self {
        Self {
            codec,
            slot: StoreSlot::new(None),
            cache: EntityCache::new(),
            next_id: Mutex::new(1),
            state: Lifecycle::default(),
            listeners: ListenerRegistry::new(),
        }
    }

    /// Attach a store. `sqlite_path` is ignored afterwards.
    pub fn with_store(self, store: Arc<dyn KvStore>) -> Self {
        Self {
            slot: StoreSlot::new(Some(store)),
            ..self
        }
    }

    fn load(&self, store: &dyn KvStore, id: ContainerId) -> Result<Option<ContainerMd>, NsError> {
        let Some(bytes) = store.get(&keys::container(id))? else {
            return Ok(None);
        };
        let mut container = self.codec.decode_container(&bytes)?;
        if !self.codec.self_contained() {
            let subcontainers = child_map(store.hget_all(&keys::subcontainers(id))?)?;
            let files = child_map(store.hget_all(&keys::files(id))?)?;
            container.restore_children(subcontainers, files);
            if let Some(raw) = store.hget(&keys::meta(id), keys::TREE_SIZE_FIELD)? {
                container.set_tree_size(decode_u64(&raw)?);
            }
        }
        Ok(Some(container))
    }
}

impl<C: Codec + 'static> ContainerMdSvc for KvContainerMdSvc<C> {
    fn configure(&self, options: &HashMap<String, String>) -> Result<(), NsError> {
        self.state.ensure_not("configure")?;
        self.slot.configure(&self.cache, options)
    }

    fn initialize(&self) -> Result<(), NsError> {
        self.state.ensure_not("initialize")?;
        let store = self.slot.connect()?;
        let next = load_counter(store.as_ref(), keys::NEXT_CONTAINER_ID)?;
        *self.next_id.lock() = next;
        self.state.set(true);
        info!(next_id = next, "kv container service initialized");
        Ok(())
    }

    fn finalize(&self) -> Result<(), NsError> {
        self.cache.clear();
        self.slot.release();
        self.state.set(false);
        debug!("kv container service finalized");
        Ok(())
    }

    fn create_container(&self) -> Result<ContainerMdPtr, NsError> {
        self.state.ensure("create_container")?;
        let store = self.slot.get("create_container")?;
        let id = allocate_id(&self.next_id, store.as_ref(), keys::NEXT_CONTAINER_ID)?;
        let container = Arc::new(RwLock::new(ContainerMd::new(id)));
        self.cache.put(id, container.clone());
        self.listeners
            .dispatch(&ContainerMdEvent::new(id, DETACHED, ContainerChange::Created));
        Ok(container)
    }

    fn get_container_md(&self, id: ContainerId) -> Result<ContainerMdPtr, NsError> {
        self.state.ensure("get_container_md")?;
        if let Some(container) = self.cache.get(id) {
            return Ok(container);
        }
        let store = self.slot.get("get_container_md")?;
        match self.load(store.as_ref(), id)? {
            Some(container) => Ok(self.cache.insert(id, Arc::new(RwLock::new(container)))),
            None => Err(NsError::IdNotFound {
                kind: EntityKind::Container,
                id,
            }),
        }
    }

    fn update_store(&self, container: &ContainerMdPtr) -> Result<(), NsError> {
        self.state.ensure("update_store")?;
        let store = self.slot.get("update_store")?;
        let (id, events) = {
            let mut guard = container.write();
            let id = guard.id();
            let mut batch = vec![KvOp::Set {
                key: keys::container(id),
                value: self.codec.encode_container(&guard)?,
            }];
            if !self.codec.self_contained() {
                batch.extend(
                    guard
                        .child_deltas()
                        .iter()
                        .flat_map(|delta| child_ops(id, delta)),
                );
                batch.push(KvOp::HSet {
                    key: keys::meta(id),
                    field: keys::TREE_SIZE_FIELD.into(),
                    value: encode_u64(guard.tree_size()),
                });
            }
            // Deltas stay journaled until the batch commits so a retry rewrites them.
            store.apply(&batch)?;
            guard.take_child_deltas();
            (id, container_events(&mut guard))
        };
        self.cache.put(id, container.clone());
        for event in &events {
            self.listeners.dispatch(event);
        }
        Ok(())
    }

    fn remove_container(&self, id: ContainerId) -> Result<(), NsError> {
        self.state.ensure("remove_container")?;
        let container = match self.get_container_md(id) {
            Ok(container) => container,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        let parent_id = {
            let guard = container.read();
            check_container_removable(&guard)?;
            guard.parent_id()
        };
        let mut batch = vec![KvOp::Delete {
            key: keys::container(id),
        }];
        if !self.codec.self_contained() {
            batch.extend([
                KvOp::HClear {
                    key: keys::subcontainers(id),
                },
                KvOp::HClear {
                    key: keys::files(id),
                },
                KvOp::HClear { key: keys::meta(id) },
            ]);
        }
        self.slot.get("remove_container")?.apply(&batch)?;
        self.cache.remove(id);
        self.listeners
            .dispatch(&ContainerMdEvent::new(id, parent_id, ContainerChange::Deleted));
        Ok(())
    }

    fn num_containers(&self) -> Result<u64, NsError> {
        self.state.ensure("num_containers")?;
        self.slot
            .get("num_containers")?
            .count_prefix(keys::CONTAINER_PREFIX)
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

/// File service over a [`KvStore`], records encoded with `C`.
pub struct KvFileMdSvc<C = BinaryCodec> {
    codec: C,
    slot: StoreSlot,
    cache: EntityCache<FileMd>,
    next_id: Mutex<u64>,
    state: Lifecycle,
    containers: RwLock<Option<Arc<dyn ContainerMdSvc>>>,
    listeners: ListenerRegistry<dyn FileMdChangeListener>,
}

impl<C: Codec + Default> KvFileMdSvc<C> {
    /// Create a service with the default codec and no store attached.
    pub fn new() -> Self {
        Self::with_codec(C::default())
    }
}

impl<C: Codec + Default> Default for KvFileMdSvc<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Codec> KvFileMdSvc<C> {
    /// Create a service encoding records with `codec`.
    pub fn with_codec(codec: C) -> Self {
        Self {
            codec,
            slot: StoreSlot::new(None),
            cache: EntityCache::new(),
            next_id: Mutex::new(1),
            state: Lifecycle::default(),
            containers: RwLock::new(None),
            listeners: ListenerRegistry::new(),
        }
    }

    /// Attach a store. `sqlite_path` is ignored afterwards.
    pub fn with_store(self, store: Arc<dyn KvStore>) -> Self {
        Self {
            slot: StoreSlot::new(Some(store)),
            ..self
        }
    }

    /// The container service given to [`FileMdSvc::set_container_service`].
    pub fn container_service(&self) -> Option<Arc<dyn ContainerMdSvc>> {
        self.containers.read().clone()
    }
}

impl<C: Codec + 'static> FileMdSvc for KvFileMdSvc<C> {
    fn configure(&self, options: &HashMap<String, String>) -> Result<(), NsError> {
        self.state.ensure_not("configure")?;
        self.slot.configure(&self.cache, options)
    }

    fn initialize(&self) -> Result<(), NsError> {
        self.state.ensure_not("initialize")?;
        let store = self.slot.connect()?;
        let next = load_counter(store.as_ref(), keys::NEXT_FILE_ID)?;
        *self.next_id.lock() = next;
        self.state.set(true);
        info!(next_id = next, "kv file service initialized");
        Ok(())
    }

    fn finalize(&self) -> Result<(), NsError> {
        self.cache.clear();
        self.slot.release();
        self.state.set(false);
        debug!("kv file service finalized");
        Ok(())
    }

    fn set_container_service(&self, svc: Arc<dyn ContainerMdSvc>) {
        *self.containers.write() = Some(svc);
    }

    fn create_file(&self) -> Result<FileMdPtr, NsError> {
        self.state.ensure("create_file")?;
        let store = self.slot.get("create_file")?;
        let id = allocate_id(&self.next_id, store.as_ref(), keys::NEXT_FILE_ID)?;
        let file = Arc::new(RwLock::new(FileMd::new(id)));
        self.cache.put(id, file.clone());
        self.listeners
            .dispatch(&FileMdEvent::new(id, DETACHED, FileChange::Created));
        Ok(file)
    }

    fn get_file_md(&self, id: FileId) -> Result<FileMdPtr, NsError> {
        self.state.ensure("get_file_md")?;
        if let Some(file) = self.cache.get(id) {
            return Ok(file);
        }
        let store = self.slot.get("get_file_md")?;
        match store.get(&keys::file(id))? {
            Some(bytes) => {
                let file = self.codec.decode_file(&bytes)?;
                Ok(self.cache.insert(id, Arc::new(RwLock::new(file))))
            }
            None => Err(NsError::IdNotFound {
                kind: EntityKind::File,
                id,
            }),
        }
    }

    fn update_store(&self, file: &FileMdPtr) -> Result<(), NsError> {
        self.state.ensure("update_store")?;
        let store = self.slot.get("update_store")?;
        let (id, events) = {
            let mut guard = file.write();
            let id = guard.id();
            store.apply(&[KvOp::Set {
                key: keys::file(id),
                value: self.codec.encode_file(&guard)?,
            }])?;
            (id, file_events(&mut guard))
        };
        self.cache.put(id, file.clone());
        for event in &events {
            self.listeners.dispatch(event);
        }
        Ok(())
    }

    fn remove_file(&self, id: FileId) -> Result<(), NsError> {
        self.state.ensure("remove_file")?;
        let file = match self.get_file_md(id) {
            Ok(file) => file,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        let container_id = {
            let guard = file.read();
            check_file_removable(&guard)?;
            guard.container_id()
        };
        self.slot
            .get("remove_file")?
            .apply(&[KvOp::Delete { key: keys::file(id) }])?;
        self.cache.remove(id);
        self.listeners
            .dispatch(&FileMdEvent::new(id, container_id, FileChange::Deleted));
        Ok(())
    }

    fn num_files(&self) -> Result<u64, NsError> {
        self.state.ensure("num_files")?;
        self.slot.get("num_files")?.count_prefix(keys::FILE_PREFIX)
    }

    fn add_change_listener(&self, listener: Arc<dyn FileMdChangeListener>) {
        self.listeners.add(listener);
    }

    fn notify_listeners(&self, event: &FileMdEvent) {
        self.listeners.dispatch(event);
    }
}
