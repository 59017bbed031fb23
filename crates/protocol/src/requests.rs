//! Control requests and responses
//!
//! One variant per control operation. Encoding these on the wire is left to
//! the host marshalling layer.

use crate::types::{
    ConfigDescriptorRequest, DeviceId, DeviceInfo, HideRuleRequest, ProcessId, RedirectorHandle,
};
use serde::{Deserialize, Serialize};

/// Control operation submitted to the filter core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlRequest {
    /// Number of live child devices
    CountDevices,
    /// Snapshot of all live child devices, failing if more than `capacity`
    EnumerateDevices { capacity: usize },
    /// Cached configuration descriptor of one device
    GetConfigurationDescriptor(ConfigDescriptorRequest),
    /// Hand a device over to the requesting process
    AddRedirect {
        id: DeviceId,
        requestor: ProcessId,
    },
    /// Tear down a redirection owned by `pid` (or any owner)
    RemoveRedirect { id: DeviceId, pid: ProcessId },
    /// Add a dynamic hide rule
    AddHideRule(HideRuleRequest),
    /// Add a persistent hide rule
    AddPersistentHideRule(HideRuleRequest),
    /// Drop all dynamic hide rules
    ClearHideRules,
    /// Drop dynamic rules and reload persistent ones from storage
    ReloadRegistryParameters,
}

/// Successful result of a [`ControlRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlResponse {
    Count(usize),
    Devices(Vec<DeviceInfo>),
    ConfigurationDescriptor(#[serde(with = "serde_bytes")] Vec<u8>),
    Redirected(RedirectorHandle),
    Done,
}

impl ControlRequest {
    /// Short operation name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::CountDevices => "CountDevices",
            Self::EnumerateDevices { .. } => "EnumerateDevices",
            Self::GetConfigurationDescriptor(_) => "GetConfigurationDescriptor",
            Self::AddRedirect { .. } => "AddRedirect",
            Self::RemoveRedirect { .. } => "RemoveRedirect",
            Self::AddHideRule(_) => "AddHideRule",
            Self::AddPersistentHideRule(_) => "AddPersistentHideRule",
            Self::ClearHideRules => "ClearHideRules",
            Self::ReloadRegistryParameters => "ReloadRegistryParameters",
        }
    }
}
