//! Discovery & Metadata Fetcher (C4).
//!
//! Owns the two discovery entry points and the per-kind metadata fetch
//! that chases device-info/platform-info/maintenance-resource once a
//! device is known. Every mutation goes through [`Registry`]; every
//! listener delivery happens from a lock-free snapshot.
use std::sync::Arc;

use futures::StreamExt;

use crate::callbacks::{deliver, Event};
use crate::config::Config;
use crate::model::{DeviceInfo, DiscoveryRecord, PlatformInfo, Representation};
use crate::ports::ProtocolEngine;
use crate::registry::{DeviceEntry, DeviceId, Registry};

/// Well-known resource path and filter constants.
pub const WELL_KNOWN_RESOURCES: &str = "/oic/res";
pub const DEVICE_RESOURCE_TYPE: &str = "oic.wk.d";
pub const DEVICE_RESOURCE_URI: &str = "/oic/d";
pub const PLATFORM_RESOURCE_URI: &str = "/oic/p";
pub const MAINTENANCE_RESOURCE_TYPE: &str = "oic.wk.mnt";

pub struct Fetcher {
    engine: Arc<dyn ProtocolEngine>,
    registry: Arc<Registry>,
    config: Config,
}

impl Fetcher {
    pub fn new(engine: Arc<dyn ProtocolEngine>, registry: Arc<Registry>, config: Config) -> Self {
        Self {
            engine,
            registry,
            config,
        }
    }

    /// `discoverAllOnHost`: wildcard-resource query against a known host.
    pub async fn discover_all_on_host(&self, host: &str) -> anyhow::Result<()> {
        self.run_discovery(Some(host), WELL_KNOWN_RESOURCES).await
    }

    /// `discoverByTypes`: multicast per type, empty ⇒ unrestricted.
    pub async fn discover_by_types(&self, types: &[String]) -> anyhow::Result<()> {
        if types.is_empty() {
            return self.run_discovery(None, WELL_KNOWN_RESOURCES).await;
        }
        for rt in types {
            let uri = format!("{}?rt={}", WELL_KNOWN_RESOURCES, rt);
            self.run_discovery(None, &uri).await?;
        }
        Ok(())
    }

    async fn run_discovery(&self, host: Option<&str>, uri: &str) -> anyhow::Result<()> {
        let mut stream = self.engine.find_resource(host, uri).await?;
        while let Some(record) = stream.next().await {
            self.on_discovery_record(record).await;
        }
        Ok(())
    }

    /// The discovery-record response handler: insert/update under the lock,
    /// then deliver outside it, then chase follow-up work for brand new
    /// devices.
    pub async fn on_discovery_record(&self, record: DiscoveryRecord) {
        let device_id = DeviceId(record.device_id.clone());
        let host = record.host.clone();
        let path = record.resource_path.clone();
        let (entry, outcome) = self.registry.insert_or_update(record).await;

        // `insert_or_update` records the resource by path/types/interfaces
        // but has no protocol-engine dependency of its own to resolve a
        // live handle; bind it here once the entry exists.
        if let Some(handle) = self.engine.bind_resource(&host, &path).await {
            self.registry.bind_resource_handle(&device_id, &path, handle).await;
        }

        {
            let mut state = entry.write().await;
            state.last_response_time_to_discovery = std::time::Instant::now();
            state.device_not_responding_indicated = false;
        }

        let resource_types = entry.read().await.discovered_resource_types.iter().cloned().collect();
        let listeners = self.registry.snapshot_listeners().await;
        deliver(
            &listeners,
            Event::DeviceDiscovered {
                device_id: device_id.clone(),
                responsive: true,
                updated: outcome.changed,
                device_info: entry.read().await.device_info.get(),
                resource_types,
            },
        );

        if outcome.is_new_device {
            // `discover_all_on_host` loops back into this function through
            // `run_discovery`; boxing this call breaks the otherwise
            // infinite-size async recursion cycle.
            let _ = Box::pin(self.discover_all_on_host(&host)).await;
            self.fetch_common_resources(&entry).await;
        }
    }

    /// Issues a fetch for each metadata kind that's neither available nor
    /// over the retry cap. The per-kind request count increments on issue
    /// regardless of outcome.
    pub async fn fetch_common_resources(&self, entry: &Arc<DeviceEntry>) {
        let cap = self.config.metadata_retry_cap;
        let (need_device, need_platform, need_maintenance, host) = {
            let state = entry.read().await;
            (
                state.device_info.needs_fetch(cap),
                state.platform_info.needs_fetch(cap),
                state.maintenance_resource.needs_fetch(cap),
                state.device_uris.first().cloned(),
            )
        };

        let Some(host) = host else { return };

        if need_device {
            {
                let mut state = entry.write().await;
                state.device_info.mark_requested();
            }
            if let Ok(rep) = self.engine.get_device_info(&host, DEVICE_RESOURCE_URI).await {
                self.on_device_info_response(&host, rep).await;
            }
        }

        if need_platform {
            {
                let mut state = entry.write().await;
                state.platform_info.mark_requested();
            }
            if let Ok(rep) = self.engine.get_platform_info(&host, PLATFORM_RESOURCE_URI).await {
                self.on_platform_info_response(&host, rep).await;
            }
        }

        if need_maintenance {
            let mut state = entry.write().await;
            state.maintenance_resource.mark_requested();
            // Presence of the resource type in the union set stands in for
            // the maintenance-resource probe in this crate: there's no
            // dedicated response payload for it beyond availability.
            if state.discovered_resource_types.contains(MAINTENANCE_RESOURCE_TYPE) {
                state.maintenance_resource.fill(());
            }
        }
    }

    /// `onDeviceInfoResponse`: locate by secondary index, populate fields,
    /// flip availability, fire a second `DeviceDiscovered`.
    pub async fn on_device_info_response(&self, host: &str, rep: Representation) {
        let Some(entry) = self.registry.lookup_by_uri(host).await else {
            return;
        };

        let already_available = entry.read().await.device_info.available();
        if already_available {
            return;
        }

        let info = DeviceInfo {
            device_name: string_field(&rep, "n"),
            software_version: string_field(&rep, "icv"),
            data_model_versions: string_field(&rep, "dmv"),
            protocol_independent_id: string_field(&rep, "piid"),
        };

        {
            let mut state = entry.write().await;
            state.device_info.fill(info);
            if !state.device_uris.iter().any(|u| u == host) {
                state.device_uris.push(host.to_string());
            }
        }

        let listeners = self.registry.snapshot_listeners().await;
        deliver(
            &listeners,
            Event::DeviceDiscovered {
                device_id: entry.device_id.clone(),
                responsive: true,
                updated: true,
                device_info: entry.read().await.device_info.get(),
                resource_types: entry.read().await.discovered_resource_types.iter().cloned().collect(),
            },
        );
    }

    /// `onPlatformInfoResponse`: same shape as device-info, no Bus event —
    /// only device-info re-fires `DeviceDiscovered`.
    pub async fn on_platform_info_response(&self, host: &str, rep: Representation) {
        let Some(entry) = self.registry.lookup_by_uri(host).await else {
            return;
        };

        let already_available = entry.read().await.platform_info.available();
        if already_available {
            return;
        }

        let info = PlatformInfo {
            platform_id: string_field(&rep, "pi"),
            manufacturer_name: string_field(&rep, "mnmn"),
            manufacturer_url: string_field(&rep, "mnml"),
            model_number: string_field(&rep, "mnmo"),
            manufacturing_date: string_field(&rep, "mndt"),
            platform_version: string_field(&rep, "mnpv"),
            os_version: string_field(&rep, "mnos"),
            hardware_version: string_field(&rep, "mnhw"),
            firmware_version: string_field(&rep, "mnfv"),
            support_url: string_field(&rep, "mnsl"),
            reference_time: string_field(&rep, "st"),
        };

        let mut state = entry.write().await;
        state.platform_info.fill(info);
        if !state.device_uris.iter().any(|u| u == host) {
            state.device_uris.push(host.to_string());
        }
    }
}

fn string_field(rep: &Representation, key: &str) -> String {
    rep.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DiscoveryRecord;
    use crate::ports::mock::MockEngine;
    use serde_json::json;

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
    async fn new_device_fires_discovered_and_fetches_metadata() {
        let engine = Arc::new(MockEngine::new());
        engine.set_device_info(
            "coap://h1/a",
            [("n".to_string(), json!("Alpha")), ("icv".to_string(), json!("ocf.1.0"))]
                .into_iter()
                .collect(),
        );
        let registry = Arc::new(Registry::new());
        let fetcher = Fetcher::new(engine.clone(), registry.clone(), Config::fast_for_tests());

        fetcher.on_discovery_record(record("A", "coap://h1/a")).await;

        let entry = registry.lookup(&DeviceId::from("A")).await.unwrap();
        let state = entry.read().await;
        assert!(state.device_info.available());
        assert_eq!(state.device_info.get().unwrap().device_name, "Alpha");
        assert_eq!(engine.device_info_requests(), 1);
    }

    #[tokio::test]
    async fn retry_cap_stops_after_three_attempts() {
        let engine = Arc::new(MockEngine::new());
        let registry = Arc::new(Registry::new());
        let fetcher = Fetcher::new(engine.clone(), registry.clone(), Config::fast_for_tests());

        let (entry, _) = registry.insert_or_update(record("A", "coap://h1/a")).await;
        for _ in 0..5 {
            fetcher.fetch_common_resources(&entry).await;
        }

        assert_eq!(engine.device_info_requests(), 3);
    }
}
