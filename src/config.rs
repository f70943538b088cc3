//! Runtime configuration: the tunables behind the fixed timing constants,
//! and the identity the application registers at [`crate::Core::start`].
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Identifies the hosting application to the protocol stack at [`Start`](crate::Core::start).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppInfo {
    pub app_id: String,
    pub device_name: String,
}

/// The timing knobs, broken out of the hardcoded constants so tests
/// can shrink them instead of sleeping for real.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How long a device may sit with `deviceOpenCount == 0` before the
    /// maintenance loop evicts it. Default 300s.
    pub idle_eviction: Duration,

    /// How long since the last discovery response before a device is
    /// flagged not-responding. Default 60s.
    pub not_responding: Duration,

    /// Maintenance tick period. Default 2s.
    pub maintenance_period: Duration,

    /// MOT discovery timeout inside the security worker. Default 5s.
    pub mot_discovery_timeout: Duration,

    /// Security completion rendezvous timeout. Default 30s.
    pub security_completion_timeout: Duration,

    /// Per-kind metadata fetch retry cap. Default 3.
    pub metadata_retry_cap: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            idle_eviction: Duration::from_secs(300),
            not_responding: Duration::from_secs(60),
            maintenance_period: Duration::from_secs(2),
            mot_discovery_timeout: Duration::from_secs(5),
            security_completion_timeout: Duration::from_secs(30),
            metadata_retry_cap: 3,
        }
    }
}

impl Config {
    /// A config with every window shrunk to millisecond scale, used by the
    /// scenario tests so they don't sleep for real minutes. Not
    /// `cfg(test)`-gated: the `tests/` integration suite links against the
    /// crate as an external consumer and needs this constructor too.
    pub fn fast_for_tests() -> Self {
        Self {
            idle_eviction: Duration::from_millis(40),
            not_responding: Duration::from_millis(20),
            maintenance_period: Duration::from_millis(5),
            mot_discovery_timeout: Duration::from_millis(50),
            security_completion_timeout: Duration::from_millis(80),
            metadata_retry_cap: 3,
        }
    }
}
