//! `devlink`: a client-side coordination layer for discovering networked
//! devices that advertise resources, issuing CRUD/observe operations
//! against them, and enrolling as a multi-owner subowner of a device.
//!
//! The hard part lives in [`Core`] (the Lifecycle Controller) and
//! the modules it wires together: [`registry`] (the Device Registry and
//! Device Entry, C1/C2), [`callbacks`] (the Callback Bus, C3),
//! [`fetcher`] (Discovery & Metadata Fetcher, C4), [`dispatcher`]
//! (Operation Dispatcher, C5), [`maintenance`] (the background
//! maintenance loop, C6), and [`security`] (the multi-owner access
//! orchestrator, C7). The wire protocol engine, TLS/DTLS stack,
//! provisioning primitives, and persistent-storage backend are injected
//! capabilities defined in [`ports`], never implemented by this crate.
pub mod callbacks;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fetcher;
pub mod lifecycle;
pub mod maintenance;
pub mod model;
pub mod ports;
pub mod registry;
pub mod security;
mod utils;

pub use callbacks::{CallbackInfo, Event, Listener, ListenerId};
pub use config::{AppInfo, Config};
pub use error::{CoreError, Status};
pub use lifecycle::Core;
pub use model::{DeviceInfo, DiscoveryRecord, OperationKind, PlatformInfo, Representation};
pub use registry::DeviceId;
pub use security::PinCallback;
