//! The framework's two-tier error model.
//!
//! [`Status`] is data: the status taxonomy an application inspects on a terminal
//! callback event, or gets back synchronously from a dispatch call that
//! failed before ever reaching the protocol engine. [`CoreError`] is a real
//! `thiserror` error for conditions the framework itself cannot recover
//! from (a poisoned internal lock, a channel that hung up). A `CoreError`
//! is always converted to `Status::Fail` at the public API boundary; it
//! never otherwise escapes this crate.
use thiserror::Error;

/// Result alias used by the public, synchronously-failing API surface.
pub type Result<T> = core::result::Result<T, Status>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("an internal lock was poisoned")]
    LockPoisoned,

    #[error("an internal channel was closed")]
    ChannelClosed,

    #[error("persistent storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<CoreError> for Status {
    fn from(_: CoreError) -> Self {
        Status::Fail
    }
}

/// A failure reported by the protocol engine, provisioning primitives, or
/// persistent-storage capability (the injected collaborators).
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("no device responded to the discovery request")]
    NoResponse,

    #[error("the transport reported a failure: {0}")]
    TransportFailure(String),

    #[error("the request timed out")]
    Timeout,

    #[error("the supplied url was invalid: {0}")]
    InvalidUrl(String),
}

/// The status taxonomy. Carried as event data, never as a panic payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    Fail,
    OutOfMemory,
    InvalidArgument,
    DeviceNotDiscovered,
    ResourceNotFound,
    InformationNotAvailable,
    AccessDenied,
    ResourceCreated,
    ResourceDeleted,
    SecurityUpdateRequestFinished,
    SecurityUpdateRequestFailed,
    SecurityUpdateRequestNotSupported,
}

impl Status {
    /// True for the statuses that represent successful completion of an
    /// operation, even when the operation's specific outcome isn't a bare
    /// `Ok` (e.g. `ResourceCreated`).
    pub fn is_success(self) -> bool {
        matches!(
            self,
            Status::Ok
                | Status::ResourceCreated
                | Status::ResourceDeleted
                | Status::SecurityUpdateRequestFinished
        )
    }
}
