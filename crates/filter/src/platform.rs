//! Collaborator interfaces consumed by the filter core
//!
//! The core never talks to hardware or to the OS device tree directly.
//! Identity probing, resets and device-stack attachment go through these
//! traits so the state machine can be driven by a real bus backend or by a
//! scripted one in tests.
//!
//! Every method may block briefly. Callers never invoke them while holding
//! a registry or hub lock.

use protocol::{DeviceDescriptor, DeviceSpeed, ProcessId, RedirectorHandle};
use std::fmt;
use thiserror::Error;

/// Opaque reference to a device node in the host's device tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeHandle(pub u64);

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{:x}", self.0)
    }
}

/// Failure reported by a platform collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    /// The node is gone
    #[error("No such device")]
    NoSuchDevice,

    /// The node exists but cannot serve the request yet
    #[error("Device not ready")]
    NotReady,

    #[error("{0}")]
    Failed(String),
}

pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

/// Bus identity probing for a device node
pub trait BusProbe: Send + Sync {
    fn device_id(&self, node: NativeHandle) -> PlatformResult<String>;

    fn instance_id(&self, node: NativeHandle) -> PlatformResult<String>;

    /// Location string, e.g. `Port_#0001.Hub_#0004`
    fn location_id(&self, node: NativeHandle) -> PlatformResult<String>;

    /// Port number on the parent hub
    fn port(&self, node: NativeHandle) -> PlatformResult<u32>;

    fn speed(&self, node: NativeHandle) -> PlatformResult<DeviceSpeed>;

    fn device_descriptor(&self, node: NativeHandle) -> PlatformResult<DeviceDescriptor>;

    /// Full configuration descriptor (header plus all sub-descriptors)
    fn configuration_descriptor(&self, node: NativeHandle, index: u8) -> PlatformResult<Vec<u8>>;
}

/// Hardware control requests sent to a device
pub trait HardwareControl: Send + Sync {
    /// Port reset keeping the device enumerated
    fn reset(&self, node: NativeHandle) -> PlatformResult<()>;

    /// Port cycle: the device disappears from and re-appears on the bus
    fn cycle(&self, node: NativeHandle) -> PlatformResult<()>;

    /// SET_CONFIGURATION request
    fn set_configuration(&self, node: NativeHandle, configuration: u8) -> PlatformResult<()>;
}

/// OS device-stack services
pub trait DeviceStack: Send + Sync {
    /// Ask the OS to build a filtered stack on `node`. The OS answers by
    /// calling [`crate::ControlDevice::add_device`] for the node.
    fn attach_to_device_stack(&self, node: NativeHandle) -> PlatformResult<()>;

    /// Open a handle to the redirector device on `node` inside `requestor`
    fn open_user_handle(
        &self,
        node: NativeHandle,
        requestor: ProcessId,
    ) -> PlatformResult<RedirectorHandle>;
}

/// Everything the core needs from the host
pub trait Platform: BusProbe + HardwareControl + DeviceStack {}

impl<T: BusProbe + HardwareControl + DeviceStack> Platform for T {}
