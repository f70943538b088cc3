use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::model::OwnershipTransferMethod;
use crate::registry::DeviceId;

/// An opaque MOT-capable device handle obtained from
/// [`Provisioning::discover_multiple_owner_enabled_device`].
#[derive(Debug, Clone)]
pub struct MotHandle {
    pub device_uuid: Uuid,
}

/// Handles the random-device-PIN path: the device itself generates the PIN
/// and the application has to read it off the device and type it back in.
/// Registered once with [`Provisioning::register_input_pin_callback`] at
/// `Start` and forwarded every time the provisioning stack needs one.
#[async_trait]
pub trait InputPinHandler: Send + Sync {
    async fn on_input_pin_required(
        &self,
        device_id: DeviceId,
        method: OwnershipTransferMethod,
        buffer_size: usize,
    ) -> Option<String>;
}

/// Handles the display-PIN path: the application generates (or is handed)
/// a PIN that a human needs to read and enter on the device itself.
/// Registered once with [`Provisioning::register_display_pin_callback`] at
/// `Start`.
#[async_trait]
pub trait DisplayPinHandler: Send + Sync {
    async fn on_display_pin(&self, device_id: DeviceId, method: OwnershipTransferMethod, pin: String);
}

/// The provisioning / ownership-transfer primitives. Exactly the surface
/// the security orchestrator (C7) needs and nothing more.
#[async_trait]
pub trait Provisioning: Send + Sync {
    async fn provision_init(&self, db_path: &str) -> Result<(), ProtocolError>;

    async fn discover_multiple_owner_enabled_device(
        &self,
        timeout: Duration,
        uuid: Uuid,
    ) -> Result<Option<MotHandle>, ProtocolError>;

    async fn is_subowner_of_device(&self, handle: &MotHandle) -> Result<bool, ProtocolError>;

    async fn selected_ownership_transfer_method(
        &self,
        handle: &MotHandle,
    ) -> Result<OwnershipTransferMethod, ProtocolError>;

    async fn add_preconfig_pin(&self, handle: &MotHandle, pin: &str) -> Result<(), ProtocolError>;

    /// Starts the transfer; completion is reported asynchronously via
    /// [`crate::security::SecurityOrchestrator::complete_ownership_transfer`],
    /// mirroring `doMultipleOwnershipTransfer(onComplete)`.
    async fn do_multiple_ownership_transfer(&self, handle: &MotHandle) -> Result<(), ProtocolError>;

    /// Registers the sole handler invoked for the random-device-PIN path.
    /// A later registration replaces the previous one.
    async fn register_input_pin_callback(&self, handler: std::sync::Arc<dyn InputPinHandler>);

    /// Clears whatever handler `register_input_pin_callback` last installed.
    async fn deregister_input_pin_callback(&self);

    /// Registers the sole handler invoked for the display-PIN path.
    async fn register_display_pin_callback(&self, handler: std::sync::Arc<dyn DisplayPinHandler>);

    /// Clears whatever handler `register_display_pin_callback` last installed.
    async fn deregister_display_pin_callback(&self);
}
