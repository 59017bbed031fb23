//! Control-plane error types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome reported to the caller of a control operation
///
/// This set is stable: internal failures of any step collapse into one of
/// these variants before they leave the filter core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ControlError {
    /// Device or redirection absent
    #[error("Object not found")]
    NotFound,

    /// Duplicate redirection or hide rule
    #[error("Object already exists")]
    AlreadyExists,

    /// Caller capacity smaller than the live device count
    #[error("Buffer too small")]
    BufferTooSmall,

    /// Device did not come back in time or could not be opened
    #[error("Device not connected")]
    NotConnected,

    /// Redirection was being removed while it was set up
    #[error("Device removed")]
    DeviceRemoved,

    /// Malformed request field
    #[error("Invalid parameter")]
    InvalidParameter,

    /// Request is not valid for the addressed device
    #[error("Invalid device request")]
    InvalidRequest,

    /// Allocation failure
    #[error("Insufficient resources")]
    InsufficientResources,

    /// Durable rule storage could not be read
    #[error("Storage unavailable")]
    StorageUnavailable,
}

/// Type alias for control-plane results
pub type Result<T> = std::result::Result<T, ControlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(ControlError::NotConnected.to_string(), "Device not connected");
        assert!(ControlError::BufferTooSmall.to_string().contains("too small"));
    }
}
