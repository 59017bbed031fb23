//! Control-plane data model for the USB interception filter
//!
//! This crate defines the records shared between the filter core and the
//! host marshalling layer: device identities and enumeration records,
//! hide-rule requests, control requests/responses and the stable set of
//! user-visible error outcomes.
//!
//! # Example
//!
//! ```
//! use protocol::{ControlRequest, HideRuleRequest, MATCH_ALL};
//!
//! let rule = HideRuleRequest::for_device(0x1234, 0x5678, true).with_force(true);
//! assert_eq!(rule.class, MATCH_ALL);
//!
//! let request = ControlRequest::AddHideRule(rule);
//! assert_eq!(request.name(), "AddHideRule");
//! ```

pub mod error;
pub mod requests;
pub mod types;

pub use error::{ControlError, Result};
pub use requests::{ControlRequest, ControlResponse};
pub use types::{
    ConfigDescriptorRequest, DeviceDescriptor, DeviceId, DeviceInfo, DeviceSpeed,
    HideRuleRequest, HideRuleType, MATCH_ALL, ProcessId, RedirectorHandle, USB_CLASS_HUB,
};
