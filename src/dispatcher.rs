//! Operation Dispatcher (C5): translates app-issued CRUD/observe requests
//! into protocol calls against a resolved resource handle, and maps
//! protocol result codes back to the status taxonomy.
use std::sync::Arc;

use futures::StreamExt;

use crate::callbacks::{deliver, CallbackInfo, Event};
use crate::error::{Result as CoreResult, Status};
use crate::model::{map_status, OperationKind, ProtocolCode, Representation};
use crate::ports::{QueryParams, ResourceHandle};
use crate::registry::{DeviceEntry, DeviceId, Registry};

pub struct Dispatcher {
    registry: Arc<Registry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Resolution rule: exact path match first, then the first resource
    /// whose types include the requested `resource_type`.
    async fn resolve_handle(
        &self,
        entry: &Arc<DeviceEntry>,
        resource_path: &str,
        resource_type: Option<&str>,
    ) -> Option<Arc<dyn ResourceHandle>> {
        let state = entry.read().await;
        if let Some(record) = state.resource_map.get(resource_path) {
            if let Some(handle) = &record.handle {
                return Some(handle.clone());
            }
        }
        if let Some(rt) = resource_type {
            return state
                .resource_map
                .values()
                .filter(|r| r.handle.is_some())
                .find(|r| r.types.iter().any(|t| t == rt))
                .and_then(|r| r.handle.clone());
        }
        None
    }

    async fn resolve(
        &self,
        device_id: &DeviceId,
        resource_path: &str,
        resource_type: Option<&str>,
    ) -> CoreResult<(Arc<DeviceEntry>, Arc<dyn ResourceHandle>)> {
        let entry = self
            .registry
            .lookup(device_id)
            .await
            .ok_or(Status::DeviceNotDiscovered)?;
        let handle = self
            .resolve_handle(&entry, resource_path, resource_type)
            .await
            .ok_or(Status::ResourceNotFound)?;
        Ok((entry, handle))
    }

    fn query_params(ctx: &CallbackInfo) -> QueryParams {
        QueryParams {
            resource_type: ctx.resource_type.clone(),
            resource_interface: ctx.resource_interface.clone(),
        }
    }

    pub async fn get_properties(&self, device_id: &DeviceId, ctx: CallbackInfo) -> CoreResult<()> {
        let (_entry, handle) = self
            .resolve(device_id, &ctx.resource_path, ctx.resource_type.as_deref())
            .await?;
        let query = Self::query_params(&ctx);
        let result = handle.get(&query).await;
        self.complete_get(result, ctx).await;
        Ok(())
    }

    async fn complete_get(
        &self,
        result: Result<(ProtocolCode, Representation), crate::error::ProtocolError>,
        ctx: CallbackInfo,
    ) {
        let (status, rep) = match result {
            Ok((code, rep)) => (map_status(code, OperationKind::GetProperties), rep),
            Err(_) => (Status::Fail, Representation::new()),
        };
        let listeners = self.registry.snapshot_listeners().await;
        deliver(&listeners, Event::GetComplete { status, rep, ctx });
    }

    pub async fn set_properties(
        &self,
        device_id: &DeviceId,
        ctx: CallbackInfo,
        payload: Representation,
    ) -> CoreResult<()> {
        let (_entry, handle) = self
            .resolve(device_id, &ctx.resource_path, ctx.resource_type.as_deref())
            .await?;
        let query = Self::query_params(&ctx);
        let result = handle.post(&query, payload).await;
        let (status, rep) = match result {
            Ok((code, rep)) => (map_status(code, OperationKind::SetProperties), rep),
            Err(_) => (Status::Fail, Representation::new()),
        };
        let listeners = self.registry.snapshot_listeners().await;
        deliver(&listeners, Event::SetComplete { status, rep, ctx });
        Ok(())
    }

    pub async fn create_resource(
        &self,
        device_id: &DeviceId,
        ctx: CallbackInfo,
        payload: Representation,
    ) -> CoreResult<()> {
        let (_entry, handle) = self
            .resolve(device_id, &ctx.resource_path, ctx.resource_type.as_deref())
            .await?;
        let query = Self::query_params(&ctx);
        let result = handle.post(&query, payload).await;
        let (status, rep) = match result {
            Ok((code, rep)) => (map_status(code, OperationKind::CreateResource), rep),
            Err(_) => (Status::Fail, Representation::new()),
        };
        let listeners = self.registry.snapshot_listeners().await;
        deliver(&listeners, Event::CreateComplete { status, rep, ctx });
        Ok(())
    }

    pub async fn delete_resource(&self, device_id: &DeviceId, ctx: CallbackInfo) -> CoreResult<()> {
        let (_entry, handle) = self
            .resolve(device_id, &ctx.resource_path, ctx.resource_type.as_deref())
            .await?;
        let query = Self::query_params(&ctx);
        let result = handle.delete_resource(&query).await;
        let status = match result {
            Ok((code, _)) => map_status(code, OperationKind::DeleteResource),
            Err(_) => Status::Fail,
        };
        let listeners = self.registry.snapshot_listeners().await;
        deliver(&listeners, Event::DeleteComplete { status, ctx });
        Ok(())
    }

    /// Observe pins the resolved handle into `ctx.bound_handle` — so a
    /// later `StopObserve` can cancel against the exact subscription rather
    /// than re-resolving by path — and bumps `outstanding_observes` so the
    /// maintenance loop won't evict the device mid-subscription.
    pub async fn observe(&self, device_id: &DeviceId, mut ctx: CallbackInfo) -> CoreResult<()> {
        let (entry, handle) = self
            .resolve(device_id, &ctx.resource_path, ctx.resource_type.as_deref())
            .await?;
        ctx.bound_handle = Some(handle.clone());
        {
            let mut state = entry.write().await;
            state.outstanding_observes += 1;
        }

        let query = Self::query_params(&ctx);
        let registry = self.registry.clone();
        let entry_for_task = entry.clone();
        let ctx_for_task = ctx.clone();
        match handle.observe(&query).await {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    while let Some(item) = stream.next().await {
                        let (status, rep) = match item {
                            Ok((code, rep)) => (map_status(code, OperationKind::Observe), rep),
                            Err(_) => (Status::Fail, Representation::new()),
                        };
                        let listeners = registry.snapshot_listeners().await;
                        deliver(
                            &listeners,
                            Event::ObserveUpdate {
                                status,
                                rep,
                                ctx: ctx_for_task.clone(),
                            },
                        );
                    }
                    let mut state = entry_for_task.write().await;
                    state.outstanding_observes = state.outstanding_observes.saturating_sub(1);
                });
                Ok(())
            }
            Err(_) => {
                let mut state = entry.write().await;
                state.outstanding_observes = state.outstanding_observes.saturating_sub(1);
                Err(Status::Fail)
            }
        }
    }

    /// Cancels through the exact handle `Observe` pinned into
    /// `ctx.bound_handle`, rather than re-resolving a handle by path (which
    /// could resolve to a different resource if the device's advertised
    /// resources changed since the subscription was opened).
    pub async fn stop_observe(&self, device_id: &DeviceId, ctx: CallbackInfo) -> CoreResult<()> {
        let entry = self
            .registry
            .lookup(device_id)
            .await
            .ok_or(Status::DeviceNotDiscovered)?;
        let handle = ctx.bound_handle.ok_or(Status::ResourceNotFound)?;
        handle.cancel_observe().await.map_err(|_| Status::Fail)?;
        let mut state = entry.write().await;
        state.outstanding_observes = state.outstanding_observes.saturating_sub(1);
        Ok(())
    }

    pub async fn is_observable(&self, device_id: &DeviceId, resource_path: &str) -> CoreResult<bool> {
        let (_entry, handle) = self.resolve(device_id, resource_path, None).await?;
        Ok(handle.is_observable())
    }

    /// `Ping`: typed discovery against the device's first known URI,
    /// recording `lastPingTime` on successful dispatch. This crate
    /// models the dispatch itself as a liveness-timestamp update, since the
    /// discovery fan-out is owned by the fetcher (C4), not the dispatcher.
    pub async fn ping(&self, device_id: &DeviceId) -> CoreResult<()> {
        let entry = self
            .registry
            .lookup(device_id)
            .await
            .ok_or(Status::DeviceNotDiscovered)?;
        let mut state = entry.write().await;
        state.last_ping_time = Some(std::time::Instant::now());
        Ok(())
    }

    pub async fn copy_device_info(&self, device_id: &DeviceId) -> CoreResult<crate::model::DeviceInfo> {
        let entry = self
            .registry
            .lookup(device_id)
            .await
            .ok_or(Status::DeviceNotDiscovered)?;
        entry
            .read()
            .await
            .device_info
            .get()
            .ok_or(Status::InformationNotAvailable)
    }

    pub async fn copy_platform_info(&self, device_id: &DeviceId) -> CoreResult<crate::model::PlatformInfo> {
        let entry = self
            .registry
            .lookup(device_id)
            .await
            .ok_or(Status::DeviceNotDiscovered)?;
        entry
            .read()
            .await
            .platform_info
            .get()
            .ok_or(Status::InformationNotAvailable)
    }

    pub async fn copy_resource_paths(&self, device_id: &DeviceId) -> CoreResult<Vec<String>> {
        let entry = self
            .registry
            .lookup(device_id)
            .await
            .ok_or(Status::DeviceNotDiscovered)?;
        Ok(entry.read().await.resource_map.keys().cloned().collect())
    }

    pub async fn copy_resource_info(
        &self,
        device_id: &DeviceId,
        resource_path: &str,
    ) -> CoreResult<(Vec<String>, Vec<String>)> {
        let entry = self
            .registry
            .lookup(device_id)
            .await
            .ok_or(Status::DeviceNotDiscovered)?;
        let state = entry.read().await;
        let record = state.resource_map.get(resource_path).ok_or(Status::ResourceNotFound)?;
        Ok((record.types.clone(), record.interfaces.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DiscoveryRecord;
    use crate::ports::mock::MockEngine;
    use crate::ports::ProtocolEngine;

    async fn discovered(registry: &Arc<Registry>, engine: &Arc<MockEngine>, device_id: &str) {
        engine.push_discovery(DiscoveryRecord {
            device_id: device_id.to_string(),
            host: "coap://h1/a".to_string(),
            resource_path: "/p1".to_string(),
            resource_types: vec!["t1".to_string()],
            resource_interfaces: vec!["if1".to_string()],
            observable: true,
        });
        let mut stream = engine.find_resource(None, "/oic/res").await.unwrap();
        use futures::StreamExt;
        while let Some(record) = stream.next().await {
            let (entry, _) = registry.insert_or_update(record.clone()).await;
            let handle = engine.bind_resource(&record.host, &record.resource_path).await.unwrap();
            registry
                .bind_resource_handle(&entry.device_id, &record.resource_path, handle)
                .await;
        }
    }

    #[tokio::test]
    async fn get_on_unknown_device_fails_synchronously() {
        let registry = Arc::new(Registry::new());
        let dispatcher = Dispatcher::new(registry);
        let ctx = CallbackInfo::new(OperationKind::GetProperties, "/p1", 1);
        let result = dispatcher.get_properties(&DeviceId::from("Z"), ctx).await;
        assert_eq!(result.unwrap_err(), Status::DeviceNotDiscovered);
    }

    #[tokio::test]
    async fn set_then_get_round_trips_through_mock_resource() {
        let engine = Arc::new(MockEngine::new());
        let registry = Arc::new(Registry::new());
        discovered(&registry, &engine, "A").await;
        let dispatcher = Dispatcher::new(registry);

        let mut payload = Representation::new();
        payload.insert("x".to_string(), serde_json::json!(1));
        let ctx = CallbackInfo::new(OperationKind::SetProperties, "/p1", 1);
        dispatcher
            .set_properties(&DeviceId::from("A"), ctx, payload)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn resource_not_found_when_path_and_type_both_miss() {
        let engine = Arc::new(MockEngine::new());
        let registry = Arc::new(Registry::new());
        discovered(&registry, &engine, "A").await;
        let dispatcher = Dispatcher::new(registry);

        let ctx = CallbackInfo::new(OperationKind::GetProperties, "/missing", 1);
        let result = dispatcher.get_properties(&DeviceId::from("A"), ctx).await;
        assert_eq!(result.unwrap_err(), Status::ResourceNotFound);
    }

    struct RecordingListener(std::sync::Mutex<Vec<Event>>);

    impl crate::callbacks::Listener for RecordingListener {
        fn on_event(&self, event: Event) {
            self.0.lock().unwrap().push(event);
        }
    }

    /// A device-returned `Unauthorized` on Set maps to `AccessDenied`,
    /// never to a bare `Fail`.
    #[tokio::test]
    async fn unauthorized_set_maps_to_access_denied() {
        let engine = Arc::new(MockEngine::new());
        let registry = Arc::new(Registry::new());
        discovered(&registry, &engine, "A").await;

        let listener = Arc::new(RecordingListener(std::sync::Mutex::new(Vec::new())));
        registry.register_listener(listener.clone()).await;

        engine
            .resource_handle("coap://h1/a", "/p1")
            .unwrap()
            .script_next_post_code(ProtocolCode::Unauthorized);

        let dispatcher = Dispatcher::new(registry);
        let ctx = CallbackInfo::new(OperationKind::SetProperties, "/p1", 1);
        dispatcher
            .set_properties(&DeviceId::from("A"), ctx, Representation::new())
            .await
            .unwrap();

        let events = listener.0.lock().unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::SetComplete { status: Status::AccessDenied, .. })));
    }
}
