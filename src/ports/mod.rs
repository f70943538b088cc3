//! The injected capabilities: narrow trait interfaces to the wire protocol
//! engine, the provisioning/ownership-transfer primitives, and the
//! persistent-storage backend. This crate implements none of them for
//! real, out of scope here — it only defines the seams and ships an
//! in-memory mock of each, the way the teacher crate ships `transport::mock`
//! unconditionally rather than behind a test-only feature.
mod engine;
mod provisioning;
mod storage;

pub mod mock;

pub use engine::{ProtocolEngine, QueryParams, ResourceHandle};
pub use provisioning::{DisplayPinHandler, InputPinHandler, MotHandle, Provisioning};
pub use storage::{PersistentStorage, StorageHandle};
