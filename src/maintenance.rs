//! Maintenance Loop (C6): the single 2-second background task that scans
//! the registry for eviction candidates, not-responding devices, and
//! incomplete metadata, and cooperates with `Stop()` via a `Notify`.
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Notify;

use crate::callbacks::{deliver, Event};
use crate::config::Config;
use crate::fetcher::Fetcher;
use crate::registry::Registry;

pub struct Maintenance {
    registry: Arc<Registry>,
    fetcher: Arc<Fetcher>,
    config: Config,
    stop: Arc<Notify>,
}

impl Maintenance {
    pub fn new(registry: Arc<Registry>, fetcher: Arc<Fetcher>, config: Config, stop: Arc<Notify>) -> Self {
        Self {
            registry,
            fetcher,
            config,
            stop,
        }
    }

    /// Runs ticks until `stop` is notified. Consumes `self` because the
    /// lifecycle controller owns exactly one running loop at a time.
    pub async fn run(self) {
        loop {
            tokio::select! {
                _ = self.stop.notified() => {
                    log::info!("maintenance loop stopping");
                    return;
                }
                _ = tokio::time::sleep(self.config.maintenance_period) => {
                    self.tick().await;
                }
            }
        }
    }

    /// One maintenance iteration: classify, evict, re-fetch, notify.
    async fn tick(&self) {
        log::trace!("maintenance tick");
        let now = Instant::now();
        let devices = self.registry.snapshot_devices().await;

        let mut idle = Vec::new();
        let mut not_responding = Vec::new();
        let mut incomplete = Vec::new();

        for entry in devices {
            let is_idle = {
                let state = entry.read().await;
                state.device_open_count == 0
                    && state
                        .last_close_device_time
                        .map(|t| now.duration_since(t) > self.config.idle_eviction)
                        .unwrap_or(false)
                    && state.outstanding_observes == 0
                    && !state.security.is_started
            };

            if is_idle {
                idle.push(entry);
                continue;
            }

            let mut state = entry.write().await;
            if !state.device_not_responding_indicated
                && now.duration_since(state.last_response_time_to_discovery) > self.config.not_responding
            {
                state.device_not_responding_indicated = true;
                drop(state);
                not_responding.push(entry.clone());
            } else {
                drop(state);
            }

            let state = entry.read().await;
            if !state.device_info.available() || !state.platform_info.available() || !state.maintenance_resource.available()
            {
                drop(state);
                incomplete.push(entry.clone());
            }
        }

        for entry in &idle {
            self.registry.remove(&entry.device_id).await;
            log::info!("evicted idle device {}", entry.device_id);
        }

        for entry in &incomplete {
            self.fetcher.fetch_common_resources(entry).await;
        }

        if !not_responding.is_empty() {
            let listeners = self.registry.snapshot_listeners().await;
            for entry in &not_responding {
                let resource_types = entry.read().await.discovered_resource_types.iter().cloned().collect();
                deliver(
                    &listeners,
                    Event::DeviceDiscovered {
                        device_id: entry.device_id.clone(),
                        responsive: false,
                        updated: false,
                        device_info: entry.read().await.device_info.get(),
                        resource_types,
                    },
                );
            }
        }
    }
}
