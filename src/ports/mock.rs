//! In-memory stand-ins for the injected capabilities, used by this crate's
//! own test suite and available to downstream integration tests. Mirrors
//! the teacher crate's unconditionally-shipped `transport::mock` module.
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::model::{DiscoveryRecord, OwnershipTransferMethod, ProtocolCode, Representation};
use crate::ports::engine::QueryParams;
use crate::ports::{
    DisplayPinHandler, InputPinHandler, MotHandle, PersistentStorage, ProtocolEngine, Provisioning,
    ResourceHandle, StorageHandle,
};
use crate::registry::DeviceId;

/// A scriptable [`ProtocolEngine`] that returns canned discovery records and
/// metadata responses, and tracks every request it was asked to perform so
/// tests can assert on call counts (e.g. the metadata retry cap).
#[derive(Default)]
pub struct MockEngine {
    inner: Mutex<MockEngineInner>,
}

#[derive(Default)]
struct MockEngineInner {
    discovery_queue: Vec<DiscoveryRecord>,
    device_info: HashMap<String, Representation>,
    platform_info: HashMap<String, Representation>,
    resources: HashMap<(String, String), Arc<MockResourceHandle>>,
    device_info_requests: u32,
    platform_info_requests: u32,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_discovery(&self, record: DiscoveryRecord) {
        let mut inner = self.inner.lock().unwrap();
        let handle = Arc::new(MockResourceHandle::new(
            record.host.clone(),
            record.resource_path.clone(),
            record.resource_types.clone(),
            record.resource_interfaces.clone(),
            record.observable,
        ));
        inner
            .resources
            .insert((record.host.clone(), record.resource_path.clone()), handle);
        inner.discovery_queue.push(record);
    }

    pub fn set_device_info(&self, host: &str, rep: Representation) {
        self.inner
            .lock()
            .unwrap()
            .device_info
            .insert(host.to_string(), rep);
    }

    pub fn set_platform_info(&self, host: &str, rep: Representation) {
        self.inner
            .lock()
            .unwrap()
            .platform_info
            .insert(host.to_string(), rep);
    }

    pub fn device_info_requests(&self) -> u32 {
        self.inner.lock().unwrap().device_info_requests
    }

    pub fn platform_info_requests(&self) -> u32 {
        self.inner.lock().unwrap().platform_info_requests
    }

    /// Looks up the scriptable mock handle for a previously-pushed
    /// discovery record, so a test can call
    /// [`MockResourceHandle::script_next_post_code`] on it directly.
    pub fn resource_handle(&self, host: &str, path: &str) -> Option<Arc<MockResourceHandle>> {
        self.inner
            .lock()
            .unwrap()
            .resources
            .get(&(host.to_string(), path.to_string()))
            .cloned()
    }
}

#[async_trait]
impl ProtocolEngine for MockEngine {
    async fn find_resource(
        &self,
        host: Option<&str>,
        _uri: &str,
    ) -> Result<BoxStream<'static, DiscoveryRecord>, ProtocolError> {
        let inner = self.inner.lock().unwrap();
        let records: Vec<_> = inner
            .discovery_queue
            .iter()
            .filter(|r| host.is_none() || host == Some(r.host.as_str()))
            .cloned()
            .collect();
        Ok(Box::pin(stream::iter(records)))
    }

    async fn get_device_info(
        &self,
        host: &str,
        _uri: &str,
    ) -> Result<Representation, ProtocolError> {
        let mut inner = self.inner.lock().unwrap();
        inner.device_info_requests += 1;
        inner
            .device_info
            .get(host)
            .cloned()
            .ok_or(ProtocolError::NoResponse)
    }

    async fn get_platform_info(
        &self,
        host: &str,
        _uri: &str,
    ) -> Result<Representation, ProtocolError> {
        let mut inner = self.inner.lock().unwrap();
        inner.platform_info_requests += 1;
        inner
            .platform_info
            .get(host)
            .cloned()
            .ok_or(ProtocolError::NoResponse)
    }

    async fn bind_resource(
        &self,
        host: &str,
        path: &str,
    ) -> Option<Arc<dyn ResourceHandle>> {
        let inner = self.inner.lock().unwrap();
        inner
            .resources
            .get(&(host.to_string(), path.to_string()))
            .cloned()
            .map(|h| h as Arc<dyn ResourceHandle>)
    }
}

/// A resource handle that echoes back whatever was last posted to it.
///
/// [`Self::script_next_post_code`] lets a test override the protocol code
/// the *next* `post` call responds with (e.g. `Unauthorized`, to exercise
/// an access-denied scenario) without having to fake a transport error;
/// every other call uses the sensible per-operation default.
pub struct MockResourceHandle {
    host: String,
    uri: String,
    types: Vec<String>,
    interfaces: Vec<String>,
    observable: bool,
    state: Mutex<Representation>,
    next_post_code: Mutex<Option<ProtocolCode>>,
}

impl MockResourceHandle {
    pub fn new(
        host: String,
        uri: String,
        types: Vec<String>,
        interfaces: Vec<String>,
        observable: bool,
    ) -> Self {
        Self {
            host,
            uri,
            types,
            interfaces,
            observable,
            state: Mutex::new(Representation::new()),
            next_post_code: Mutex::new(None),
        }
    }

    pub fn script_next_post_code(&self, code: ProtocolCode) {
        *self.next_post_code.lock().unwrap() = Some(code);
    }
}

#[async_trait]
impl ResourceHandle for MockResourceHandle {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn resource_types(&self) -> &[String] {
        &self.types
    }

    fn resource_interfaces(&self) -> &[String] {
        &self.interfaces
    }

    fn is_observable(&self) -> bool {
        self.observable
    }

    fn sid(&self) -> &str {
        &self.uri
    }

    async fn get(&self, _query: &QueryParams) -> Result<(ProtocolCode, Representation), ProtocolError> {
        Ok((ProtocolCode::Ok, self.state.lock().unwrap().clone()))
    }

    async fn post(
        &self,
        _query: &QueryParams,
        payload: Representation,
    ) -> Result<(ProtocolCode, Representation), ProtocolError> {
        let code = self
            .next_post_code
            .lock()
            .unwrap()
            .take()
            .unwrap_or(ProtocolCode::ResourceChanged);
        if code == ProtocolCode::Unauthorized {
            return Ok((code, Representation::new()));
        }
        let mut state = self.state.lock().unwrap();
        state.extend(payload);
        Ok((code, state.clone()))
    }

    async fn delete_resource(
        &self,
        _query: &QueryParams,
    ) -> Result<(ProtocolCode, Representation), ProtocolError> {
        let mut state = self.state.lock().unwrap();
        state.clear();
        Ok((ProtocolCode::ResourceDeleted, Representation::new()))
    }

    async fn observe(
        &self,
        _query: &QueryParams,
    ) -> Result<BoxStream<'static, Result<(ProtocolCode, Representation), ProtocolError>>, ProtocolError> {
        Ok(Box::pin(stream::empty()))
    }

    async fn cancel_observe(&self) -> Result<(), ProtocolError> {
        Ok(())
    }
}

/// A scriptable [`Provisioning`] mock: devices must be registered with
/// [`MockProvisioning::register`] before they can be "discovered" for MOT.
#[derive(Default)]
pub struct MockProvisioning {
    inner: Mutex<MockProvisioningInner>,
}

#[derive(Default)]
struct MockProvisioningInner {
    devices: HashMap<Uuid, MockMotDevice>,
    input_pin_handler: Option<Arc<dyn InputPinHandler>>,
    display_pin_handler: Option<Arc<dyn DisplayPinHandler>>,
}

struct MockMotDevice {
    subowner: bool,
    method: OwnershipTransferMethod,
}

impl MockProvisioning {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, uuid: Uuid, subowner: bool, method: OwnershipTransferMethod) {
        self.inner.lock().unwrap().devices.insert(
            uuid,
            MockMotDevice { subowner, method },
        );
    }

    pub fn mark_subowner(&self, uuid: Uuid) {
        if let Some(dev) = self.inner.lock().unwrap().devices.get_mut(&uuid) {
            dev.subowner = true;
        }
    }

    /// Simulates the device-side random-PIN prompt: invokes whatever
    /// `InputPinHandler` is currently registered, the way a real transfer
    /// primitive would when it hits the random-PIN step.
    pub async fn simulate_input_pin_required(
        &self,
        device_id: DeviceId,
        method: OwnershipTransferMethod,
        buffer_size: usize,
    ) -> Option<String> {
        let handler = self.inner.lock().unwrap().input_pin_handler.clone()?;
        handler.on_input_pin_required(device_id, method, buffer_size).await
    }

    /// Simulates the device-side display-PIN prompt.
    pub async fn simulate_display_pin(&self, device_id: DeviceId, method: OwnershipTransferMethod, pin: String) {
        let handler = self.inner.lock().unwrap().display_pin_handler.clone();
        if let Some(handler) = handler {
            handler.on_display_pin(device_id, method, pin).await;
        }
    }
}

#[async_trait]
impl Provisioning for MockProvisioning {
    async fn provision_init(&self, _db_path: &str) -> Result<(), ProtocolError> {
        Ok(())
    }

    async fn discover_multiple_owner_enabled_device(
        &self,
        _timeout: Duration,
        uuid: Uuid,
    ) -> Result<Option<MotHandle>, ProtocolError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .devices
            .get(&uuid)
            .map(|_| MotHandle { device_uuid: uuid }))
    }

    async fn is_subowner_of_device(&self, handle: &MotHandle) -> Result<bool, ProtocolError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .devices
            .get(&handle.device_uuid)
            .map(|d| d.subowner)
            .unwrap_or(false))
    }

    async fn selected_ownership_transfer_method(
        &self,
        handle: &MotHandle,
    ) -> Result<OwnershipTransferMethod, ProtocolError> {
        let inner = self.inner.lock().unwrap();
        inner
            .devices
            .get(&handle.device_uuid)
            .map(|d| d.method)
            .ok_or(ProtocolError::NoResponse)
    }

    async fn add_preconfig_pin(&self, _handle: &MotHandle, _pin: &str) -> Result<(), ProtocolError> {
        Ok(())
    }

    /// Simulates the real transfer primitive's random-PIN step: a device
    /// registered with [`OwnershipTransferMethod::RandomDevicePin`] invokes
    /// whatever `InputPinHandler` is currently registered, the same way the
    /// real provisioning stack would when it hits that step.
    async fn do_multiple_ownership_transfer(&self, handle: &MotHandle) -> Result<(), ProtocolError> {
        let method = self
            .inner
            .lock()
            .unwrap()
            .devices
            .get(&handle.device_uuid)
            .map(|d| d.method);
        if method == Some(OwnershipTransferMethod::RandomDevicePin) {
            let device_id = DeviceId::from(handle.device_uuid.to_string().as_str());
            self.simulate_input_pin_required(device_id, OwnershipTransferMethod::RandomDevicePin, 0)
                .await;
        }
        Ok(())
    }

    async fn register_input_pin_callback(&self, handler: Arc<dyn InputPinHandler>) {
        self.inner.lock().unwrap().input_pin_handler = Some(handler);
    }

    async fn deregister_input_pin_callback(&self) {
        self.inner.lock().unwrap().input_pin_handler = None;
    }

    async fn register_display_pin_callback(&self, handler: Arc<dyn DisplayPinHandler>) {
        self.inner.lock().unwrap().display_pin_handler = Some(handler);
    }

    async fn deregister_display_pin_callback(&self) {
        self.inner.lock().unwrap().display_pin_handler = None;
    }
}

/// An in-memory [`PersistentStorage`], backed by a map of path -> bytes.
#[derive(Default, Clone)]
pub struct MockStorage {
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MockStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistentStorage for MockStorage {
    fn open(&self, path: &str, writable: bool) -> io::Result<Box<dyn StorageHandle>> {
        let contents = self.files.lock().unwrap().get(path).cloned().unwrap_or_default();
        Ok(Box::new(MockStorageHandle {
            path: path.to_string(),
            writable,
            position: 0,
            contents,
            files: self.files.clone(),
        }))
    }

    fn unlink(&self, path: &str) -> io::Result<()> {
        self.files.lock().unwrap().remove(path);
        Ok(())
    }
}

struct MockStorageHandle {
    path: String,
    writable: bool,
    position: usize,
    contents: Vec<u8>,
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl StorageHandle for MockStorageHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.contents[self.position.min(self.contents.len())..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.position += n;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.writable {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"));
        }
        self.contents.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn close(&mut self) -> io::Result<()> {
        self.files
            .lock()
            .unwrap()
            .insert(self.path.clone(), self.contents.clone());
        Ok(())
    }
}
