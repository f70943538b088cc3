//! Device Registry (C2) and Device Entry (C1).
//!
//! All mutation goes through [`Registry`], which serializes access with a
//! single `tokio::sync::Mutex`. Conceptually this wants a *reentrant* lock
//! so that callback delivery triggered from inside `insert_or_update` can
//! safely call back into the registry. Rust's stdlib/tokio mutexes aren't
//! reentrant, so instead: every method that would have recursed
//! takes the lock itself exactly once, and delegates to a private
//! `*_locked` helper that assumes the guard is already held. No public
//! method ever calls another public method while holding the lock.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, Notify, RwLock};

use crate::callbacks::{Event, Listener, ListenerId};
use crate::model::{DeviceInfo, DiscoveryRecord, PlatformInfo};
use crate::ports::ResourceHandle;

/// A stable, UUID-shaped device identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        DeviceId(s.to_string())
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single advertised resource, as recorded in a [`DeviceEntry`]'s
/// `resourceMap`. `handle` starts `None`: a resource is recorded the
/// moment a discovery response names it, but the opaque protocol-engine
/// reference is resolved and bound separately (see
/// [`Registry::bind_resource_handle`]) since `insert_or_update` itself has
/// no protocol-engine dependency.
#[derive(Clone)]
pub struct ResourceRecord {
    pub path: String,
    pub types: Vec<String>,
    pub interfaces: Vec<String>,
    pub handle: Option<Arc<dyn ResourceHandle>>,
}

/// Availability + retry-count tracking for a piece of metadata that's
/// fetched lazily and capped at `metadata_retry_cap` attempts.
#[derive(Default, Clone)]
pub struct MetadataSlot<T> {
    value: Option<T>,
    request_count: u8,
}

impl<T: Clone> MetadataSlot<T> {
    pub fn available(&self) -> bool {
        self.value.is_some()
    }

    pub fn request_count(&self) -> u8 {
        self.request_count
    }

    pub fn get(&self) -> Option<T> {
        self.value.clone()
    }

    pub fn mark_requested(&mut self) {
        self.request_count += 1;
    }

    pub fn fill(&mut self, value: T) {
        self.value = Some(value);
    }

    pub fn needs_fetch(&self, cap: u8) -> bool {
        !self.available() && self.request_count < cap
    }
}

/// Per-device security sub-state (C7's share of the Device Entry).
pub struct SecurityState {
    pub is_started: bool,
    pub subowner: bool,
    pub device_uuid: Option<uuid::Uuid>,
    pub completion: Arc<Notify>,
}

impl Default for SecurityState {
    fn default() -> Self {
        Self {
            is_started: false,
            subowner: false,
            device_uuid: None,
            completion: Arc::new(Notify::new()),
        }
    }
}

/// The mutable contents of a [`DeviceEntry`], held behind its `RwLock`.
///
/// No `#[derive(Default)]`: `last_response_time_to_discovery` is an
/// `Instant`, which has no `Default` impl (there's no meaningful "zero"
/// instant), so it's seeded with `Instant::now()` explicitly below.
pub struct DeviceEntryState {
    pub device_uris: Vec<String>,
    pub resource_map: HashMap<String, ResourceRecord>,
    pub discovered_resource_types: HashSet<String>,
    pub discovered_resource_interfaces: HashSet<String>,
    pub device_info: MetadataSlot<DeviceInfo>,
    pub platform_info: MetadataSlot<PlatformInfo>,
    pub maintenance_resource: MetadataSlot<()>,
    pub device_open_count: u32,
    pub last_close_device_time: Option<Instant>,
    pub last_response_time_to_discovery: Instant,
    pub device_not_responding_indicated: bool,
    pub last_ping_time: Option<Instant>,
    pub security: SecurityState,
    /// Count of live `CallbackInfo`s holding a bound resource handle for
    /// this device (open observe subscriptions). The maintenance loop
    /// refuses to evict while this is nonzero.
    pub outstanding_observes: u32,
}

impl DeviceEntryState {
    fn new(now: Instant) -> Self {
        Self {
            device_uris: Vec::new(),
            resource_map: HashMap::new(),
            discovered_resource_types: HashSet::new(),
            discovered_resource_interfaces: HashSet::new(),
            device_info: MetadataSlot::default(),
            platform_info: MetadataSlot::default(),
            maintenance_resource: MetadataSlot::default(),
            device_open_count: 0,
            last_close_device_time: None,
            last_response_time_to_discovery: now,
            device_not_responding_indicated: false,
            last_ping_time: None,
            security: SecurityState::default(),
            outstanding_observes: 0,
        }
    }
}

/// The aggregate per-device record ("Device Entry"). Shared by
/// `Arc` between the registry's two maps and any listener holding a
/// reference across a callback, never copied.
pub struct DeviceEntry {
    pub device_id: DeviceId,
    state: RwLock<DeviceEntryState>,
}

impl DeviceEntry {
    fn new(device_id: DeviceId, now: Instant) -> Self {
        Self {
            device_id,
            state: RwLock::new(DeviceEntryState::new(now)),
        }
    }

    pub async fn read(&self) -> tokio::sync::RwLockReadGuard<'_, DeviceEntryState> {
        self.state.read().await
    }

    pub async fn write(&self) -> tokio::sync::RwLockWriteGuard<'_, DeviceEntryState> {
        self.state.write().await
    }
}

/// Outcome flags returned by [`Registry::insert_or_update`].
#[derive(Debug, Clone, Copy)]
pub struct UpsertOutcome {
    pub is_new_device: bool,
    pub changed: bool,
}

struct Inner {
    by_id: HashMap<DeviceId, Arc<DeviceEntry>>,
    by_uri: HashMap<String, DeviceId>,
    listeners: Vec<(ListenerId, Arc<dyn Listener>)>,
    next_listener_id: u64,
}

impl Inner {
    fn new() -> Self {
        Self {
            by_id: HashMap::new(),
            by_uri: HashMap::new(),
            listeners: Vec::new(),
            next_listener_id: 0,
        }
    }
}

/// The Device Registry (C2): device-id -> Device Entry, plus the host-URI
/// secondary index, under one lock.
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
        }
    }

    pub async fn lookup(&self, device_id: &DeviceId) -> Option<Arc<DeviceEntry>> {
        self.inner.lock().await.by_id.get(device_id).cloned()
    }

    pub async fn lookup_by_uri(&self, uri: &str) -> Option<Arc<DeviceEntry>> {
        let inner = self.inner.lock().await;
        let id = inner.by_uri.get(uri)?;
        inner.by_id.get(id).cloned()
    }

    /// Creates the entry if absent, appends the resource, unions in new
    /// types/interfaces, adds the host URI if new, and reports what changed.
    pub async fn insert_or_update(&self, record: DiscoveryRecord) -> (Arc<DeviceEntry>, UpsertOutcome) {
        let mut inner = self.inner.lock().await;
        let device_id = DeviceId(record.device_id.clone());

        let is_new_device = !inner.by_id.contains_key(&device_id);
        if is_new_device {
            let entry = Arc::new(DeviceEntry::new(device_id.clone(), Instant::now()));
            inner.by_id.insert(device_id.clone(), entry);
        }
        let entry = inner.by_id.get(&device_id).unwrap().clone();

        // Register the secondary index entry under the registry lock,
        // before dropping it to touch the per-device RwLock below.
        let uri_is_new = !inner.by_uri.contains_key(&record.host);
        if uri_is_new {
            inner.by_uri.insert(record.host.clone(), device_id.clone());
        }
        drop(inner);

        let mut changed = is_new_device || uri_is_new;
        {
            let mut state = entry.write().await;
            if uri_is_new && !state.device_uris.contains(&record.host) {
                state.device_uris.push(record.host.clone());
            }

            let resource_is_new = !state.resource_map.contains_key(&record.resource_path);
            if resource_is_new {
                changed = true;
            }

            for t in &record.resource_types {
                if state.discovered_resource_types.insert(t.clone()) {
                    changed = true;
                }
            }
            for i in &record.resource_interfaces {
                if state.discovered_resource_interfaces.insert(i.clone()) {
                    changed = true;
                }
            }

            match state.resource_map.get_mut(&record.resource_path) {
                Some(existing) => {
                    existing.types = record.resource_types.clone();
                    existing.interfaces = record.resource_interfaces.clone();
                }
                None => {
                    state.resource_map.insert(
                        record.resource_path.clone(),
                        ResourceRecord {
                            path: record.resource_path.clone(),
                            types: record.resource_types.clone(),
                            interfaces: record.resource_interfaces.clone(),
                            handle: None,
                        },
                    );
                }
            }
        }

        (
            entry,
            UpsertOutcome {
                is_new_device,
                changed,
            },
        )
    }

    /// Binds a resource handle from the protocol engine onto an already
    /// recorded resource. Split out of `insert_or_update` because the
    /// registry itself has no protocol engine dependency; the fetcher (C4)
    /// calls this once it has resolved the handle.
    pub async fn bind_resource_handle(
        &self,
        device_id: &DeviceId,
        path: &str,
        handle: Arc<dyn ResourceHandle>,
    ) {
        if let Some(entry) = self.lookup(device_id).await {
            let mut state = entry.write().await;
            if let Some(record) = state.resource_map.get_mut(path) {
                record.handle = Some(handle);
            }
        }
    }

    /// Removes a device and every URI pointing to it from the secondary
    /// index.
    pub async fn remove(&self, device_id: &DeviceId) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.by_id.remove(device_id) {
            let uris = entry.read().await.device_uris.clone();
            for uri in uris {
                inner.by_uri.remove(&uri);
            }
        }
    }

    pub async fn snapshot_devices(&self) -> Vec<Arc<DeviceEntry>> {
        self.inner.lock().await.by_id.values().cloned().collect()
    }

    pub async fn register_listener(&self, listener: Arc<dyn Listener>) -> ListenerId {
        let mut inner = self.inner.lock().await;
        let id = ListenerId(inner.next_listener_id);
        inner.next_listener_id += 1;
        inner.listeners.push((id, listener));
        id
    }

    pub async fn unregister_listener(&self, id: ListenerId) {
        let mut inner = self.inner.lock().await;
        inner.listeners.retain(|(lid, _)| *lid != id);
    }

    /// Copies the listener list under the lock, then releases it; delivery
    /// always happens from the copy, never while the lock is held.
    pub(crate) async fn snapshot_listeners(&self) -> Vec<(ListenerId, Arc<dyn Listener>)> {
        self.inner.lock().await.listeners.clone()
    }
}
