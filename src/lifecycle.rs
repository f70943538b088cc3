//! Lifecycle Controller (C8) and the `Core` façade that ties C1-C8
//! together behind the public API this crate exposes to a hosting
//! application.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::callbacks::{CallbackInfo, Listener, ListenerId};
use crate::config::{AppInfo, Config};
use crate::dispatcher::Dispatcher;
use crate::error::{CoreError, Result as CoreResult, Status};
use crate::fetcher::Fetcher;
use crate::maintenance::Maintenance;
use crate::model::{DeviceInfo, PlatformInfo, Representation};
use crate::ports::{PersistentStorage, ProtocolEngine, Provisioning};
use crate::registry::{DeviceId, Registry};
use crate::security::{PinCallback, PinForwarder, SecurityOrchestrator};
use crate::utils::OwnedJoinHandle;

const PROVISION_DB_PATH: &str = "oic_svr_db_client.dat";

struct Started {
    maintenance_stop: Arc<Notify>,
    maintenance_task: OwnedJoinHandle<()>,
}

/// The in-process Device Registry and Interaction Core: the public entry
/// point an application links against.
pub struct Core {
    provisioning: Arc<dyn Provisioning>,
    storage: Arc<dyn PersistentStorage>,
    config: Config,

    registry: Arc<Registry>,
    fetcher: Arc<Fetcher>,
    dispatcher: Arc<Dispatcher>,
    security: Arc<SecurityOrchestrator>,

    start_stop: Mutex<Option<Started>>,
    is_started: AtomicBool,
    next_token: std::sync::atomic::AtomicU64,
}

impl Core {
    pub fn new(
        engine: Arc<dyn ProtocolEngine>,
        provisioning: Arc<dyn Provisioning>,
        storage: Arc<dyn PersistentStorage>,
        config: Config,
    ) -> Self {
        let registry = Arc::new(Registry::new());
        let fetcher = Arc::new(Fetcher::new(engine.clone(), registry.clone(), config.clone()));
        let dispatcher = Arc::new(Dispatcher::new(registry.clone()));
        let security = Arc::new(SecurityOrchestrator::new());

        Self {
            provisioning,
            storage,
            config,
            registry,
            fetcher,
            dispatcher,
            security,
            start_stop: Mutex::new(None),
            is_started: AtomicBool::new(false),
            next_token: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// `Start(appInfo, unitTestMode)`: idempotent, configures the
    /// provisioning database, registers the PIN-prompt callbacks, and
    /// spawns the maintenance task. `unit_test_mode` skips device/platform-
    /// info self-registration, for use by test harnesses.
    pub async fn start(&self, _app_info: AppInfo, unit_test_mode: bool) -> CoreResult<()> {
        let mut guard = self.start_stop.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        self.provisioning
            .provision_init(PROVISION_DB_PATH)
            .await
            .map_err(|_| Status::Fail)?;

        if !unit_test_mode {
            log::info!("registering device/platform info with the protocol stack");
        }

        let pin_forwarder = Arc::new(PinForwarder::new(self.registry.clone()));
        self.provisioning.register_input_pin_callback(pin_forwarder.clone()).await;
        self.provisioning.register_display_pin_callback(pin_forwarder).await;

        self.security.set_stopping(false);

        let maintenance_stop = Arc::new(Notify::new());
        let maintenance = Maintenance::new(
            self.registry.clone(),
            self.fetcher.clone(),
            self.config.clone(),
            maintenance_stop.clone(),
        );
        let maintenance_task: OwnedJoinHandle<()> = tokio::spawn(maintenance.run()).into();

        *guard = Some(Started {
            maintenance_stop,
            maintenance_task,
        });
        self.is_started.store(true, Ordering::SeqCst);
        log::info!("core started");
        Ok(())
    }

    /// `Stop(pinHandles)`: idempotent; drains security workers, deregisters
    /// the PIN-prompt callbacks, stops the maintenance loop, and leaves the
    /// registry maps intact (no implicit reset on `Stop`).
    pub async fn stop(&self) -> CoreResult<()> {
        let mut guard = self.start_stop.lock().await;
        let Some(started) = guard.take() else {
            return Ok(());
        };

        self.security.set_stopping(true);
        self.security.drain(&self.registry).await;

        self.provisioning.deregister_input_pin_callback().await;
        self.provisioning.deregister_display_pin_callback().await;

        started.maintenance_stop.notify_one();
        // `OwnedJoinHandle` aborts on drop rather than joining; take the
        // raw handle and await it here so `Stop` only returns once the
        // loop has actually exited.
        let _ = started.maintenance_task.into_inner().await;

        self.is_started.store(false, Ordering::SeqCst);
        log::info!("core stopped");
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.is_started.load(Ordering::SeqCst)
    }

    pub async fn register_listener(&self, listener: Arc<dyn Listener>) -> ListenerId {
        self.registry.register_listener(listener).await
    }

    pub async fn unregister_listener(&self, id: ListenerId) {
        self.registry.unregister_listener(id).await
    }

    /// Wraps the fetcher's `anyhow::Result` in the public status taxonomy:
    /// a discovery round that never reaches the protocol engine at all
    /// surfaces as `Status::Fail`, the same boundary conversion every other
    /// public operation on `Core` applies.
    pub async fn discover_all_on_host(&self, host: &str) -> CoreResult<()> {
        self.fetcher
            .discover_all_on_host(host)
            .await
            .map_err(|e| CoreError::from(e).into())
    }

    pub async fn discover_by_types(&self, types: &[String]) -> CoreResult<()> {
        self.fetcher
            .discover_by_types(types)
            .await
            .map_err(|e| CoreError::from(e).into())
    }

    fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    pub fn new_callback_info(&self, operation: crate::model::OperationKind, resource_path: &str) -> CallbackInfo {
        CallbackInfo::new(operation, resource_path, self.next_token())
    }

    pub async fn get_properties(&self, device_id: &DeviceId, ctx: CallbackInfo) -> CoreResult<()> {
        self.dispatcher.get_properties(device_id, ctx).await
    }

    pub async fn set_properties(
        &self,
        device_id: &DeviceId,
        ctx: CallbackInfo,
        payload: Representation,
    ) -> CoreResult<()> {
        self.dispatcher.set_properties(device_id, ctx, payload).await
    }

    pub async fn create_resource(
        &self,
        device_id: &DeviceId,
        ctx: CallbackInfo,
        payload: Representation,
    ) -> CoreResult<()> {
        self.dispatcher.create_resource(device_id, ctx, payload).await
    }

    pub async fn delete_resource(&self, device_id: &DeviceId, ctx: CallbackInfo) -> CoreResult<()> {
        self.dispatcher.delete_resource(device_id, ctx).await
    }

    pub async fn observe(&self, device_id: &DeviceId, ctx: CallbackInfo) -> CoreResult<()> {
        self.dispatcher.observe(device_id, ctx).await
    }

    pub async fn stop_observe(&self, device_id: &DeviceId, ctx: CallbackInfo) -> CoreResult<()> {
        self.dispatcher.stop_observe(device_id, ctx).await
    }

    pub async fn is_observable(&self, device_id: &DeviceId, resource_path: &str) -> CoreResult<bool> {
        self.dispatcher.is_observable(device_id, resource_path).await
    }

    pub async fn ping(&self, device_id: &DeviceId) -> CoreResult<()> {
        self.dispatcher.ping(device_id).await
    }

    pub async fn copy_device_info(&self, device_id: &DeviceId) -> CoreResult<DeviceInfo> {
        self.dispatcher.copy_device_info(device_id).await
    }

    pub async fn copy_platform_info(&self, device_id: &DeviceId) -> CoreResult<PlatformInfo> {
        self.dispatcher.copy_platform_info(device_id).await
    }

    pub async fn copy_resource_paths(&self, device_id: &DeviceId) -> CoreResult<Vec<String>> {
        self.dispatcher.copy_resource_paths(device_id).await
    }

    pub async fn copy_resource_info(
        &self,
        device_id: &DeviceId,
        resource_path: &str,
    ) -> CoreResult<(Vec<String>, Vec<String>)> {
        self.dispatcher.copy_resource_info(device_id, resource_path).await
    }

    /// `IPCADeviceOpenCalled`: bumps the per-device open refcount. A device
    /// with a nonzero count is never an eviction candidate.
    pub async fn device_open(&self, device_id: &DeviceId) -> CoreResult<()> {
        let entry = self
            .registry
            .lookup(device_id)
            .await
            .ok_or(Status::DeviceNotDiscovered)?;
        entry.write().await.device_open_count += 1;
        Ok(())
    }

    /// `IPCADeviceCloseCalled`: decrements the open refcount and records
    /// `lastCloseDeviceTime` when it reaches zero, starting the idle-
    /// eviction clock.
    pub async fn device_close(&self, device_id: &DeviceId) -> CoreResult<()> {
        let entry = self
            .registry
            .lookup(device_id)
            .await
            .ok_or(Status::DeviceNotDiscovered)?;
        let mut state = entry.write().await;
        state.device_open_count = state.device_open_count.saturating_sub(1);
        if state.device_open_count == 0 {
            state.last_close_device_time = Some(std::time::Instant::now());
        }
        Ok(())
    }

    /// `RequestAccess`: spawns a security worker unless one is already
    /// running for this device or the core is stopping.
    pub async fn request_access(&self, device_id: DeviceId, pin_cb: Arc<dyn PinCallback>) -> CoreResult<()> {
        self.security
            .request_access(
                self.registry.clone(),
                self.provisioning.clone(),
                self.config.clone(),
                device_id,
                pin_cb,
            )
            .await
    }

    /// `onMultipleOwnershipTransferComplete`: forwarded by the hosting
    /// application (or, in a real deployment, the provisioning stack's
    /// completion hook) once the transfer primitive settles.
    pub async fn complete_ownership_transfer(&self, device_id: &DeviceId, error: bool) {
        self.security
            .complete_ownership_transfer(&self.registry, device_id, error)
            .await
    }

    pub fn storage(&self) -> &Arc<dyn PersistentStorage> {
        &self.storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::mock::{MockEngine, MockProvisioning, MockStorage};

    fn test_core() -> Core {
        Core::new(
            Arc::new(MockEngine::new()),
            Arc::new(MockProvisioning::new()),
            Arc::new(MockStorage::new()),
            Config::fast_for_tests(),
        )
    }

    #[tokio::test]
    async fn start_then_start_is_a_noop() {
        let core = test_core();
        core.start(AppInfo::default(), true).await.unwrap();
        assert!(core.is_started());
        core.start(AppInfo::default(), true).await.unwrap();
        assert!(core.is_started());
        core.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_then_stop_is_a_noop() {
        let core = test_core();
        core.start(AppInfo::default(), true).await.unwrap();
        core.stop().await.unwrap();
        assert!(!core.is_started());
        core.stop().await.unwrap();
        assert!(!core.is_started());
    }

    #[tokio::test]
    async fn open_close_tracks_refcount() {
        let core = test_core();
        core.fetcher
            .on_discovery_record(crate::model::DiscoveryRecord {
                device_id: "A".to_string(),
                host: "coap://h1/a".to_string(),
                resource_path: "/p1".to_string(),
                resource_types: vec![],
                resource_interfaces: vec![],
                observable: false,
            })
            .await;

        let id = DeviceId::from("A");
        core.device_open(&id).await.unwrap();
        core.device_open(&id).await.unwrap();
        core.device_close(&id).await.unwrap();

        let entry = core.registry.lookup(&id).await.unwrap();
        assert_eq!(entry.read().await.device_open_count, 1);
    }
}
