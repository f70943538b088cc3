//! End-to-end scenarios driven through the public `Core` API against the
//! in-memory mock protocol engine/provisioning/storage.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use devlink::callbacks::{Event, Listener};
use devlink::config::{AppInfo, Config};
use devlink::lifecycle::Core;
use devlink::model::{DiscoveryRecord, OperationKind, OwnershipTransferMethod};
use devlink::ports::mock::{MockEngine, MockProvisioning, MockStorage};
use devlink::registry::DeviceId;
use devlink::security::PinCallback;

#[derive(Default)]
struct RecordingListener(Mutex<Vec<Event>>);

impl Listener for RecordingListener {
    fn on_event(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }
}

impl RecordingListener {
    fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }
}

struct NoPin;
impl PinCallback for NoPin {
    fn preconfigured_pin(&self, _device_id: &DeviceId, _buffer_size: usize) -> Option<String> {
        None
    }
}

fn record(device_id: &str, host: &str) -> DiscoveryRecord {
    DiscoveryRecord {
        device_id: device_id.to_string(),
        host: host.to_string(),
        resource_path: "/p1".to_string(),
        resource_types: vec!["t1".to_string()],
        resource_interfaces: vec!["if1".to_string()],
        observable: false,
    }
}

#[tokio::test]
async fn discovery_metadata_then_eviction() {
    let _ = env_logger::try_init();

    let engine = Arc::new(MockEngine::new());
    engine.push_discovery(record("A", "coap://h1/a"));
    engine.set_device_info(
        "coap://h1/a",
        [
            ("n".to_string(), serde_json::json!("Alpha")),
            ("icv".to_string(), serde_json::json!("ocf.1.0")),
        ]
        .into_iter()
        .collect(),
    );

    let core = Core::new(
        engine,
        Arc::new(MockProvisioning::new()),
        Arc::new(MockStorage::new()),
        Config::fast_for_tests(),
    );
    core.start(AppInfo::default(), true).await.unwrap();

    let listener = Arc::new(RecordingListener::default());
    core.register_listener(listener.clone()).await;

    core.discover_all_on_host("coap://h1/a").await.unwrap();

    let device_id = DeviceId::from("A");
    core.device_open(&device_id).await.unwrap();
    core.device_close(&device_id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    let events = listener.events();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::DeviceDiscovered { responsive: true, updated: true, .. }
    )));

    // The registry should have evicted "A" by now: idle_eviction is 40ms
    // and we slept 200ms since close.
    let paths = core.copy_resource_paths(&device_id).await;
    assert_eq!(paths, Err(devlink::Status::DeviceNotDiscovered));
}

#[tokio::test]
async fn operation_on_unknown_device_fails_synchronously_with_no_event() {
    let core = Core::new(
        Arc::new(MockEngine::new()),
        Arc::new(MockProvisioning::new()),
        Arc::new(MockStorage::new()),
        Config::fast_for_tests(),
    );
    core.start(AppInfo::default(), true).await.unwrap();

    let listener = Arc::new(RecordingListener::default());
    core.register_listener(listener.clone()).await;

    let ctx = core.new_callback_info(OperationKind::GetProperties, "/p1");
    let result = core.get_properties(&DeviceId::from("Z"), ctx).await;

    assert_eq!(result, Err(devlink::Status::DeviceNotDiscovered));
    assert!(listener.events().is_empty());
}

#[tokio::test]
async fn get_set_round_trip_through_real_discovery_flow() {
    let engine = Arc::new(MockEngine::new());
    engine.push_discovery(record("A", "coap://h1/a"));

    let core = Core::new(
        engine,
        Arc::new(MockProvisioning::new()),
        Arc::new(MockStorage::new()),
        Config::fast_for_tests(),
    );
    core.start(AppInfo::default(), true).await.unwrap();
    core.discover_all_on_host("coap://h1/a").await.unwrap();

    let device_id = DeviceId::from("A");
    let mut payload = devlink::model::Representation::new();
    payload.insert("x".to_string(), serde_json::json!(1));
    let set_ctx = core.new_callback_info(OperationKind::SetProperties, "/p1");
    core.set_properties(&device_id, set_ctx, payload).await.unwrap();

    let get_ctx = core.new_callback_info(OperationKind::GetProperties, "/p1");
    core.get_properties(&device_id, get_ctx).await.unwrap();
}

#[tokio::test]
async fn access_denied_propagation() {
    let engine = Arc::new(MockEngine::new());
    engine.push_discovery(record("A", "coap://h1/a"));

    let core = Core::new(
        engine.clone(),
        Arc::new(MockProvisioning::new()),
        Arc::new(MockStorage::new()),
        Config::fast_for_tests(),
    );
    core.start(AppInfo::default(), true).await.unwrap();
    core.discover_all_on_host("coap://h1/a").await.unwrap();

    let listener = Arc::new(RecordingListener::default());
    core.register_listener(listener.clone()).await;

    engine
        .resource_handle("coap://h1/a", "/p1")
        .unwrap()
        .script_next_post_code(devlink::model::ProtocolCode::Unauthorized);

    let device_id = DeviceId::from("A");
    let ctx = core.new_callback_info(OperationKind::SetProperties, "/p1");
    core.set_properties(&device_id, ctx, Default::default())
        .await
        .unwrap();

    let events = listener.events();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::SetComplete { status: devlink::Status::AccessDenied, .. }
    )));
}

#[tokio::test]
async fn security_happy_path_then_second_request_fails() {
    let engine = Arc::new(MockEngine::new());
    let provisioning = Arc::new(MockProvisioning::new());

    let core = Arc::new(Core::new(
        engine.clone(),
        provisioning.clone(),
        Arc::new(MockStorage::new()),
        Config::fast_for_tests(),
    ));
    core.start(AppInfo::default(), true).await.unwrap();

    let uuid = uuid::Uuid::new_v4();
    let device_id = DeviceId(uuid.to_string());
    engine.push_discovery(record(&uuid.to_string(), "coap://h1/a"));
    core.discover_all_on_host("coap://h1/a").await.unwrap();
    provisioning.register(uuid, false, OwnershipTransferMethod::RandomDevicePin);

    let listener = Arc::new(RecordingListener::default());
    core.register_listener(listener.clone()).await;

    core.request_access(device_id.clone(), Arc::new(NoPin))
        .await
        .unwrap();

    let second = core.request_access(device_id.clone(), Arc::new(NoPin)).await;
    assert_eq!(second, Err(devlink::Status::Fail));

    core.complete_ownership_transfer(&device_id, false).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let events = listener.events();
    let finished = events.iter().filter(|e| {
        matches!(
            e,
            Event::RequestAccessComplete {
                status: devlink::Status::SecurityUpdateRequestFinished,
                ..
            }
        )
    });
    assert_eq!(finished.count(), 1);

    core.stop().await.unwrap();
}

#[tokio::test]
async fn random_pin_prompt_reaches_bus_through_registered_callback() {
    let engine = Arc::new(MockEngine::new());
    let provisioning = Arc::new(MockProvisioning::new());

    let core = Arc::new(Core::new(
        engine.clone(),
        provisioning.clone(),
        Arc::new(MockStorage::new()),
        Config::fast_for_tests(),
    ));
    core.start(AppInfo::default(), true).await.unwrap();

    let uuid = uuid::Uuid::new_v4();
    let device_id = DeviceId(uuid.to_string());
    engine.push_discovery(record(&uuid.to_string(), "coap://h3/c"));
    core.discover_all_on_host("coap://h3/c").await.unwrap();
    provisioning.register(uuid, false, OwnershipTransferMethod::RandomDevicePin);

    let listener = Arc::new(RecordingListener::default());
    core.register_listener(listener.clone()).await;

    core.request_access(device_id.clone(), Arc::new(NoPin))
        .await
        .unwrap();
    // `do_multiple_ownership_transfer` invokes the registered input-PIN
    // callback synchronously on the worker task; give it a beat to run.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let events = listener.events();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::PasswordInputRequested {
            device_id: d,
            method: devlink::model::PinMethod::RandomPin,
            ..
        } if *d == device_id
    )));

    core.complete_ownership_transfer(&device_id, false).await;
    core.stop().await.unwrap();
}

#[tokio::test]
async fn stop_deregisters_pin_callbacks() {
    let core = Core::new(
        Arc::new(MockEngine::new()),
        Arc::new(MockProvisioning::new()),
        Arc::new(MockStorage::new()),
        Config::fast_for_tests(),
    );
    core.start(AppInfo::default(), true).await.unwrap();
    core.stop().await.unwrap();
    // Starting and stopping again must not panic on double-registration or
    // double-deregistration of the PIN callbacks.
    core.start(AppInfo::default(), true).await.unwrap();
    core.stop().await.unwrap();
}

#[tokio::test]
async fn security_timeout_then_stop_joins_without_hang() {
    let engine = Arc::new(MockEngine::new());
    let provisioning = Arc::new(MockProvisioning::new());

    let core = Arc::new(Core::new(
        engine.clone(),
        provisioning.clone(),
        Arc::new(MockStorage::new()),
        Config::fast_for_tests(),
    ));
    core.start(AppInfo::default(), true).await.unwrap();

    let uuid = uuid::Uuid::new_v4();
    let device_id = DeviceId(uuid.to_string());
    engine.push_discovery(record(&uuid.to_string(), "coap://h2/b"));
    core.discover_all_on_host("coap://h2/b").await.unwrap();
    provisioning.register(uuid, false, OwnershipTransferMethod::RandomDevicePin);

    core.request_access(device_id, Arc::new(NoPin)).await.unwrap();

    // Never call complete_ownership_transfer: the worker should time out
    // on its own and Stop() must still join cleanly.
    tokio::time::timeout(Duration::from_secs(5), core.stop())
        .await
        .expect("stop must not hang")
        .unwrap();
}
