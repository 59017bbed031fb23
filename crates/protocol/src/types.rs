//! Device and rule type definitions
//!
//! This module defines the records exchanged between the filter core and the
//! host marshalling layer: device identities, enumeration records, hide-rule
//! requests and the handles returned by a successful redirection.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire value meaning "match any value" in a hide-rule field.
pub const MATCH_ALL: u64 = u64::MAX;

/// USB class code advertised by hubs.
pub const USB_CLASS_HUB: u8 = 0x09;

/// Device identity as reported by the bus driver
///
/// The pair of device-ID and instance-ID strings is globally unique among
/// live devices at any instant and is the lookup key for redirections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    /// Hierarchical device ID, e.g. `USB\VID_1234&PID_5678`
    pub device_id: String,
    /// Instance ID, unique among devices sharing the device ID
    pub instance_id: String,
}

impl DeviceId {
    pub fn new(device_id: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            instance_id: instance_id.into(),
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device_id, self.instance_id)
    }
}

/// USB device speed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceSpeed {
    /// Low speed - 1.5 Mbps (USB 1.0)
    Low,
    /// Full speed - 12 Mbps (USB 1.1)
    Full,
    /// High speed - 480 Mbps (USB 2.0)
    High,
    /// SuperSpeed - 5 Gbps (USB 3.0)
    Super,
}

/// Standard USB device descriptor fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub bcd_usb: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_number_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub fn is_hub(&self) -> bool {
        self.device_class == USB_CLASS_HUB
    }
}

/// Enumeration record for one live child device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device-ID / instance-ID pair
    pub id: DeviceId,
    /// Instance number of the hub filter that owns the device
    pub filter_id: u32,
    /// Port number on the parent hub
    pub port: u32,
    /// Negotiated speed
    pub speed: DeviceSpeed,
    /// Cached device descriptor
    pub descriptor: DeviceDescriptor,
}

/// Process identifier of a redirection owner
///
/// `ProcessId::ANY` is the sentinel accepted by removal to match any owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ProcessId(pub u32);

impl ProcessId {
    pub const ANY: ProcessId = ProcessId(0);

    pub fn is_any(self) -> bool {
        self == Self::ANY
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

/// Opaque user-mode handle to a redirector device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RedirectorHandle(pub u64);

/// Request for one cached configuration descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDescriptorRequest {
    pub id: DeviceId,
    pub index: u8,
}

/// Which rule family a hide rule belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum HideRuleType {
    /// Matched against vendor, product and BCD only
    Default = 0,
    /// Additionally matched against the device's determinative class mask
    DeterminativeTypes = 1,
}

impl TryFrom<u32> for HideRuleType {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Default),
            1 => Ok(Self::DeterminativeTypes),
            other => Err(other),
        }
    }
}

/// Hide rule as submitted by a client
///
/// Each mask field is either a literal value that must fit in 32 bits or
/// [`MATCH_ALL`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HideRuleRequest {
    pub hide: bool,
    pub class: u64,
    pub vid: u64,
    pub pid: u64,
    pub bcd: u64,
    /// Raw rule-type tag, see [`HideRuleType`]
    pub rule_type: u32,
    /// Whether a match ends evaluation. When absent, a rule that does not
    /// hide forces its decision and a hiding rule does not.
    #[serde(default)]
    pub force_decision: Option<bool>,
}

impl HideRuleRequest {
    /// Rule matching one VID/PID pair on any revision and class
    pub fn for_device(vid: u16, pid: u16, hide: bool) -> Self {
        Self {
            hide,
            class: MATCH_ALL,
            vid: u64::from(vid),
            pid: u64::from(pid),
            bcd: MATCH_ALL,
            rule_type: HideRuleType::Default as u32,
            force_decision: None,
        }
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force_decision = Some(force);
        self
    }

    pub fn with_type(mut self, rule_type: HideRuleType) -> Self {
        self.rule_type = rule_type as u32;
        self
    }

    pub fn with_class(mut self, class: u64) -> Self {
        self.class = class;
        self
    }
}
