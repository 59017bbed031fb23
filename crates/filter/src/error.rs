//! Filter core error types

use crate::platform::PlatformError;
use crate::store::StorageError;
use protocol::ControlError;
use thiserror::Error;

/// Internal failure taxonomy of the filter core
#[derive(Debug, Error)]
pub enum FilterError {
    /// Device or redirection absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate redirection or rule
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Allocation or capacity failure
    #[error("Resources exhausted: {0}")]
    ResourceExhausted(String),

    /// Caller capacity below the live device count
    #[error("Buffer too small: {needed} devices, capacity {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },

    /// A bounded handshake wait ran out
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// Redirection removal started while it was being set up
    #[error("Removal in progress for {0}")]
    RemovalInProgress(String),

    /// Operation on a device that was removed or never classified
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Malformed request field
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Request does not apply to the addressed device
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Hardware or bus collaborator failure
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    /// Durable store failure
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, FilterError>;

impl From<FilterError> for ControlError {
    fn from(err: FilterError) -> Self {
        match err {
            FilterError::NotFound(_) => ControlError::NotFound,
            FilterError::AlreadyExists(_) => ControlError::AlreadyExists,
            FilterError::ResourceExhausted(_) => ControlError::InsufficientResources,
            FilterError::BufferTooSmall { .. } => ControlError::BufferTooSmall,
            FilterError::Timeout(_) => ControlError::NotConnected,
            FilterError::RemovalInProgress(_) => ControlError::DeviceRemoved,
            FilterError::InvalidState(_) => ControlError::NotConnected,
            FilterError::InvalidParameter(_) => ControlError::InvalidParameter,
            FilterError::InvalidRequest(_) => ControlError::InvalidRequest,
            FilterError::Platform(PlatformError::NoSuchDevice) => ControlError::NotFound,
            FilterError::Platform(_) => ControlError::NotConnected,
            FilterError::Storage(_) => ControlError::StorageUnavailable,
        }
    }
}
