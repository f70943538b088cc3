//! Callback Bus (C3): the ordered sequence of application listeners and
//! the event payloads they receive.
//!
//! Registration/unregistration goes through [`Registry`](crate::registry::Registry)
//! so the listener list stays consistent with the lock that serializes
//! discovery processing. Delivery itself never happens while that
//! lock is held: callers take a [`Registry::snapshot_listeners`] copy first,
//! drop the lock, and only then invoke each listener in order.
use std::sync::Arc;

use crate::error::Status;
use crate::model::{DeviceInfo, PinMethod, Representation};
use crate::ports::ResourceHandle;
use crate::registry::DeviceId;

/// Identifies a registered listener for later unregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Per-operation context a caller attaches to a dispatched request, carried
/// through to the terminal event. Cheap to clone: the dispatcher hands out
/// clones to both the in-flight bookkeeping and the eventual event payload.
///
/// `bound_handle` starts `None` and is filled in by [`crate::dispatcher::Dispatcher::observe`]
/// once it resolves the resource handle for the subscription; a caller that
/// later wants to `StopObserve` passes back the same `CallbackInfo` (with
/// `bound_handle` still set) so cancellation targets the exact subscription
/// rather than whatever the path happens to resolve to at that later time.
#[derive(Clone)]
pub struct CallbackInfo {
    pub operation: crate::model::OperationKind,
    pub resource_path: String,
    pub resource_type: Option<String>,
    pub resource_interface: Option<String>,
    pub token: u64,
    pub bound_handle: Option<Arc<dyn ResourceHandle>>,
}

impl std::fmt::Debug for CallbackInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackInfo")
            .field("operation", &self.operation)
            .field("resource_path", &self.resource_path)
            .field("resource_type", &self.resource_type)
            .field("resource_interface", &self.resource_interface)
            .field("token", &self.token)
            .field("bound_handle", &self.bound_handle.is_some())
            .finish()
    }
}

impl CallbackInfo {
    pub fn new(operation: crate::model::OperationKind, resource_path: impl Into<String>, token: u64) -> Self {
        Self {
            operation,
            resource_path: resource_path.into(),
            resource_type: None,
            resource_interface: None,
            token,
            bound_handle: None,
        }
    }
}

/// The events delivered to every registered [`Listener`] in registration
/// order.
#[derive(Debug, Clone)]
pub enum Event {
    DeviceDiscovered {
        device_id: DeviceId,
        responsive: bool,
        updated: bool,
        device_info: Option<DeviceInfo>,
        resource_types: Vec<String>,
    },
    GetComplete {
        status: Status,
        rep: Representation,
        ctx: CallbackInfo,
    },
    SetComplete {
        status: Status,
        rep: Representation,
        ctx: CallbackInfo,
    },
    CreateComplete {
        status: Status,
        rep: Representation,
        ctx: CallbackInfo,
    },
    DeleteComplete {
        status: Status,
        ctx: CallbackInfo,
    },
    ObserveUpdate {
        status: Status,
        rep: Representation,
        ctx: CallbackInfo,
    },
    RequestAccessComplete {
        status: Status,
        device_id: DeviceId,
    },
    PasswordInputRequested {
        device_id: DeviceId,
        method: PinMethod,
        buffer_size: usize,
    },
    PasswordDisplay {
        device_id: DeviceId,
        method: PinMethod,
        pin: String,
    },
}

/// An application-supplied event sink. Implementations may re-enter the
/// public API from inside `on_event`; the registry guarantees delivery
/// always happens outside its lock, so this is safe.
pub trait Listener: Send + Sync {
    fn on_event(&self, event: Event);
}

/// Delivers `event` to every listener in `snapshot`, in order. Never called
/// while the registry lock is held; see [`Registry::snapshot_listeners`].
pub(crate) fn deliver(snapshot: &[(ListenerId, Arc<dyn Listener>)], event: Event) {
    for (_, listener) in snapshot {
        listener.on_event(event.clone());
    }
}
