use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::ProtocolError;
use crate::model::{DiscoveryRecord, ProtocolCode, Representation};

/// The wire protocol engine (CoAP discovery/request/observe/block-transfer
/// in the real stack), consumed as a narrow capability.
#[async_trait]
pub trait ProtocolEngine: Send + Sync {
    /// Multicast if `host` is `None`, unicast otherwise. `uri` is the
    /// well-known-resources path, optionally carrying an `rt=` filter.
    async fn find_resource(
        &self,
        host: Option<&str>,
        uri: &str,
    ) -> Result<BoxStream<'static, DiscoveryRecord>, ProtocolError>;

    async fn get_device_info(&self, host: &str, uri: &str) -> Result<Representation, ProtocolError>;

    async fn get_platform_info(
        &self,
        host: &str,
        uri: &str,
    ) -> Result<Representation, ProtocolError>;

    /// Resolves a resource handle for a previously discovered resource, by
    /// host and path. Returns `None` if the protocol engine no longer has a
    /// live binding for it.
    async fn bind_resource(
        &self,
        host: &str,
        path: &str,
    ) -> Option<std::sync::Arc<dyn ResourceHandle>>;
}

/// An opaque reference to a single resource on a single device.
///
/// Every operation that reaches the device returns `Ok` carrying the
/// protocol-level result code the device responded with alongside the
/// representation; `Err` is reserved for the
/// request never reaching or returning from the device at all (timeout,
/// transport failure). A device-side `Unauthorized` is therefore still
/// `Ok((ProtocolCode::Unauthorized, _))`, not an `Err` — the dispatcher
/// (C5) is the one place that turns the code into a [`crate::error::Status`].
#[async_trait]
pub trait ResourceHandle: Send + Sync {
    fn uri(&self) -> &str;
    fn host(&self) -> &str;
    fn resource_types(&self) -> &[String];
    fn resource_interfaces(&self) -> &[String];
    fn is_observable(&self) -> bool;
    fn sid(&self) -> &str;

    async fn get(&self, query: &QueryParams) -> Result<(ProtocolCode, Representation), ProtocolError>;
    async fn post(
        &self,
        query: &QueryParams,
        payload: Representation,
    ) -> Result<(ProtocolCode, Representation), ProtocolError>;
    async fn delete_resource(
        &self,
        query: &QueryParams,
    ) -> Result<(ProtocolCode, Representation), ProtocolError>;
    async fn observe(
        &self,
        query: &QueryParams,
    ) -> Result<BoxStream<'static, Result<(ProtocolCode, Representation), ProtocolError>>, ProtocolError>;
    async fn cancel_observe(&self) -> Result<(), ProtocolError>;
}

/// The `rt=`/`if=` query parameters built by the dispatcher.
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pub resource_type: Option<String>,
    pub resource_interface: Option<String>,
}
