//! PnP query results and the patches applied to them
//!
//! The host passes each completed identity/capability query through
//! [`crate::ControlDevice::on_pnp`] so the bound strategy can rewrite the
//! answer before the OS sees it.

/// Device ID reported for hidden devices
pub const HIDDEN_DEVICE_ID: &str = "USB\\VID_2B23&PID_CAFE";

/// Description given to patched devices that report none
pub const PATCHED_DESCRIPTION: &str = "UsbDk device";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub raw_device_ok: bool,
    pub removable: bool,
    pub surprise_removal_ok: bool,
    pub unique_id: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    DeviceId,
    HardwareIds,
    CompatibleIds,
    InstanceId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextKind {
    Description,
    LocationInformation,
}

/// A completed PnP query, patched in place
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PnpRequest {
    QueryCapabilities(DeviceCapabilities),
    /// Single IDs carry one entry, ID lists carry several
    QueryId { kind: IdKind, ids: Vec<String> },
    QueryDeviceText { kind: TextKind, text: String },
}

/// Let the OS run a driverless device and cycle it freely
pub(crate) fn patch_capabilities(caps: &mut DeviceCapabilities) {
    caps.raw_device_ok = true;
    caps.removable = true;
    caps.surprise_removal_ok = true;
}

/// Fill in a description when the device has none
pub(crate) fn patch_description(kind: TextKind, text: &mut String) {
    if kind == TextKind::Description && text.is_empty() {
        *text = PATCHED_DESCRIPTION.to_string();
    }
}

/// Replace every identity the OS could match a driver against
///
/// All hidden devices share one device ID, so the instance ID is the
/// allocated serial number to keep them apart.
pub(crate) fn patch_hidden_ids(kind: IdKind, ids: &mut Vec<String>, serial: u32) {
    *ids = match kind {
        IdKind::InstanceId => vec![serial.to_string()],
        IdKind::DeviceId | IdKind::HardwareIds | IdKind::CompatibleIds => {
            vec![HIDDEN_DEVICE_ID.to_string()]
        }
    };
}

/// Apply the hider patches to one request
pub(crate) fn patch_hidden(request: &mut PnpRequest, serial: u32) {
    match request {
        PnpRequest::QueryCapabilities(caps) => patch_capabilities(caps),
        PnpRequest::QueryId { kind, ids } => patch_hidden_ids(*kind, ids, serial),
        PnpRequest::QueryDeviceText { kind, text } => patch_description(*kind, text),
    }
}

/// Apply the raw-filter patches to one request; IDs are left alone
pub(crate) fn patch_raw(request: &mut PnpRequest) {
    match request {
        PnpRequest::QueryCapabilities(caps) => patch_capabilities(caps),
        PnpRequest::QueryDeviceText { kind, text } => patch_description(*kind, text),
        PnpRequest::QueryId { .. } => {}
    }
}
