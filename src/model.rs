//! Wire-adjacent data types shared between the registry, the fetcher, and
//! the dispatcher. None of these types know how to go over the network;
//! that's the protocol engine's job.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// A generic property bag, the closest thing this crate has to a CBOR/JSON
/// payload coming back from a resource. Keyed by the well-known property
/// names (`n`, `icv`, `dmv`, `pi`, `mnmn`, ...).
pub type Representation = HashMap<String, serde_json::Value>;

/// One row of a discovery (`/oic/res`) response: a single resource
/// advertised by a single host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryRecord {
    pub device_id: String,
    pub host: String,
    pub resource_path: String,
    pub resource_types: Vec<String>,
    pub resource_interfaces: Vec<String>,
    pub observable: bool,
}

/// Device metadata pulled from `/oic/d`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_name: String,
    pub software_version: String,
    pub data_model_versions: String,
    pub protocol_independent_id: String,
}

/// Platform metadata pulled from `/oic/p`, an 11-field record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub platform_id: String,
    pub manufacturer_name: String,
    pub manufacturer_url: String,
    pub model_number: String,
    pub manufacturing_date: String,
    pub platform_version: String,
    pub os_version: String,
    pub hardware_version: String,
    pub firmware_version: String,
    pub support_url: String,
    pub reference_time: String,
}

/// The kinds of operation the dispatcher (C5) accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum OperationKind {
    GetProperties,
    SetProperties,
    CreateResource,
    DeleteResource,
    Observe,
    StopObserve,
    Ping,
    IsObservable,
    CopyDeviceInfo,
    CopyPlatformInfo,
    CopyResourcePaths,
    CopyResourceInfo,
}

/// The protocol-level result codes, ordered so a "strictly greater than
/// `ResourceChanged`" comparison is meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolCode {
    Ok,
    Continue,
    ResourceChanged,
    Unauthorized,
    ResourceCreated,
    ResourceDeleted,
    Other(u16),
}

impl ProtocolCode {
    fn ordinal(self) -> i32 {
        match self {
            ProtocolCode::Ok => 0,
            ProtocolCode::Continue => 1,
            ProtocolCode::ResourceChanged => 2,
            ProtocolCode::Unauthorized => 3,
            ProtocolCode::ResourceCreated => 4,
            ProtocolCode::ResourceDeleted => 5,
            ProtocolCode::Other(v) => 1000 + v as i32,
        }
    }
}

use crate::error::Status;

/// Protocol-result → framework-status mapping.
///
/// Get/Observe use the simpler ordinal rule and deliberately do not special
/// case `Unauthorized` the way Set/Create/Delete do; see DESIGN.md for why
/// this asymmetry is preserved rather than "fixed".
pub fn map_status(code: ProtocolCode, op: OperationKind) -> Status {
    use OperationKind::*;
    match op {
        GetProperties | Observe => {
            if code.ordinal() > ProtocolCode::ResourceChanged.ordinal() {
                Status::Fail
            } else {
                Status::Ok
            }
        }
        SetProperties | CreateResource | DeleteResource => match code {
            ProtocolCode::Ok | ProtocolCode::Continue | ProtocolCode::ResourceChanged => {
                Status::Ok
            }
            ProtocolCode::Unauthorized => Status::AccessDenied,
            ProtocolCode::ResourceCreated => Status::ResourceCreated,
            ProtocolCode::ResourceDeleted => Status::ResourceDeleted,
            ProtocolCode::Other(_) => Status::Fail,
        },
        StopObserve | Ping | IsObservable | CopyDeviceInfo | CopyPlatformInfo
        | CopyResourcePaths | CopyResourceInfo => {
            if code.ordinal() > ProtocolCode::ResourceChanged.ordinal() {
                Status::Fail
            } else {
                Status::Ok
            }
        }
    }
}

/// The multiple-ownership-transfer method a device has selected, mirrored
/// from the provisioning capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum OwnershipTransferMethod {
    RandomDevicePin,
    PreconfiguredPin,
    Other,
}

/// The kind of PIN prompt forwarded to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMethod {
    RandomPin,
    PreconfiguredPin,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_does_not_special_case_unauthorized() {
        // Get/Observe ignore the Unauthorized->AccessDenied case that
        // Set/Create/Delete use; Unauthorized still maps to Fail for Get
        // because its ordinal is greater than ResourceChanged's.
        assert_eq!(
            map_status(ProtocolCode::Unauthorized, OperationKind::GetProperties),
            Status::Fail
        );
        assert_eq!(
            map_status(ProtocolCode::Unauthorized, OperationKind::SetProperties),
            Status::AccessDenied
        );
    }

    #[test]
    fn resource_created_and_deleted_map_through() {
        assert_eq!(
            map_status(ProtocolCode::ResourceCreated, OperationKind::CreateResource),
            Status::ResourceCreated
        );
        assert_eq!(
            map_status(ProtocolCode::ResourceDeleted, OperationKind::DeleteResource),
            Status::ResourceDeleted
        );
    }

    #[test]
    fn other_codes_fail_everywhere() {
        assert_eq!(
            map_status(ProtocolCode::Other(999), OperationKind::SetProperties),
            Status::Fail
        );
        assert_eq!(
            map_status(ProtocolCode::Other(999), OperationKind::GetProperties),
            Status::Fail
        );
    }
}
