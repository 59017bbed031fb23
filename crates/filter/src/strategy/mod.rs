//! Per-device filter behaviour
//!
//! Every filter device binds exactly one [`Strategy`] when the host adds
//! it, chosen by [`select`] from the device identity, the hide and
//! raw-filter rules and the pending redirections. The strategy never
//! changes afterwards; a device that changes identity comes back as a new
//! filter device.

pub mod hub;
pub mod pnp;

use crate::control::ControlDevice;
use crate::filter_device::FilterDevice;
use crate::platform::{BusProbe, NativeHandle};
use common::ids::is_usb_device_id;
use protocol::{DeviceId, ProcessId};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

pub use hub::HubStrategy;
pub use pnp::{DeviceCapabilities, IdKind, PnpRequest, TextKind};

/// Device IDs of root hubs and hub-like controllers we always filter
pub const ROOT_HUB_IDS: &[&str] = &[
    "USB\\ROOT_HUB",
    "USB\\ROOT_HUB20",
    "USB\\ROOT_HUB30",
    "USB\\USB20_HUB",
    "USB\\USB30_HUB",
    "NUSB3\\ROOT_HUB30",
    "IUSB3\\ROOT_HUB30",
    "IUSB3\\ROOT_HUB31",
    "AMDUSB3\\ROOT_HUB3",
    "AMDUSB3\\ROOT_HUB31",
];

/// Device ID the bus reports when it failed to read the descriptor
pub const FAILED_ENUMERATION_ID: &str = "USB\\VID_0000&PID_0002";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// Filtering declined
    Null,
    Hub,
    /// The device handed to user mode
    Redirector,
    Hider,
    RawFilter,
}

/// Peer of a redirection on the device being redirected
#[derive(Debug)]
pub struct RedirectorStrategy {
    id: DeviceId,
    open_files: AtomicUsize,
}

impl RedirectorStrategy {
    pub fn new(id: DeviceId) -> Self {
        Self {
            id,
            open_files: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn open_files(&self) -> usize {
        self.open_files.load(Ordering::Acquire)
    }

    pub(crate) fn on_file_create(&self) {
        self.open_files.fetch_add(1, Ordering::AcqRel);
    }

    /// Count a close and pick the process the removal is done for:
    /// the closer while other opens remain, any owner after the last one
    pub(crate) fn on_file_close(&self, closer: ProcessId) -> ProcessId {
        let previous = self
            .open_files
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                Some(open.saturating_sub(1))
            })
            .unwrap_or_default();
        if previous > 1 { closer } else { ProcessId::ANY }
    }
}

/// Concealed device, reported to the OS under a shared fake identity
#[derive(Debug)]
pub struct HiderStrategy {
    serial: u32,
}

impl HiderStrategy {
    pub fn new(serial: u32) -> Self {
        Self { serial }
    }

    pub fn serial_number(&self) -> u32 {
        self.serial
    }
}

/// Driverless device kept in raw mode so it can be cycled
#[derive(Debug)]
pub struct RawFilterStrategy {
    serial: u32,
    /// Set once on the first PnP request; `false` makes the strategy a
    /// pass-through for good
    really_raw: OnceLock<bool>,
}

impl RawFilterStrategy {
    pub fn new(serial: u32) -> Self {
        Self {
            serial,
            really_raw: OnceLock::new(),
        }
    }

    pub fn serial_number(&self) -> u32 {
        self.serial
    }

    /// `None` until the first PnP request decided it
    pub fn is_really_raw(&self) -> Option<bool> {
        self.really_raw.get().copied()
    }

    fn patch(&self, ctx: &ControlDevice, node: NativeHandle, request: &mut PnpRequest) {
        let raw = match self.really_raw.get() {
            Some(raw) => *raw,
            None => match ctx.registry().find_child_by_node(node) {
                Some(child) => {
                    let raw = *self
                        .really_raw
                        .get_or_init(|| child.if_really_raw(ctx.rules()));
                    if !raw {
                        info!("{} has a function driver, raw filter idle", child.id());
                    }
                    raw
                }
                None => true,
            },
        };

        if raw {
            pnp::patch_raw(request);
        }
    }
}

/// Behaviour bound to one filter device
#[derive(Debug)]
pub enum Strategy {
    Null,
    Hub(HubStrategy),
    Redirector(RedirectorStrategy),
    Hider(HiderStrategy),
    RawFilter(RawFilterStrategy),
}

impl Strategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::Null => StrategyKind::Null,
            Strategy::Hub(_) => StrategyKind::Hub,
            Strategy::Redirector(_) => StrategyKind::Redirector,
            Strategy::Hider(_) => StrategyKind::Hider,
            Strategy::RawFilter(_) => StrategyKind::RawFilter,
        }
    }

    /// Serial number of hidden and raw-filtered devices
    pub fn serial_number(&self) -> Option<u32> {
        match self {
            Strategy::Hider(hider) => Some(hider.serial_number()),
            Strategy::RawFilter(raw) => Some(raw.serial_number()),
            Strategy::Null | Strategy::Hub(_) | Strategy::Redirector(_) => None,
        }
    }

    /// Patch a completed PnP query
    pub(crate) fn on_pnp(&self, ctx: &ControlDevice, node: NativeHandle, request: &mut PnpRequest) {
        match self {
            Strategy::Hider(hider) => pnp::patch_hidden(request, hider.serial),
            Strategy::RawFilter(raw) => raw.patch(ctx, node, request),
            Strategy::Null | Strategy::Hub(_) | Strategy::Redirector(_) => {}
        }
    }

    /// The filter device is going away
    pub(crate) fn on_removal(&self, ctx: &ControlDevice, filter: &FilterDevice) {
        match self {
            Strategy::Hub(hub) => {
                ctx.registry().unregister_filter(filter.instance());
                let children = hub.detach_all();
                if !children.is_empty() {
                    debug!("Hub {} removed with {} children", filter.instance(), children.len());
                    ctx.schedule_teardown(children);
                }
            }
            Strategy::Redirector(redirector) => {
                ctx.registry().notify_redirection_removed(redirector.id());
            }
            Strategy::Hider(_) | Strategy::RawFilter(_) => {
                ctx.registry().unregister_hidden_device(filter.instance());
            }
            Strategy::Null => {}
        }
    }
}

/// Choose the strategy for a node the host asks us to filter
///
/// Root hubs and nodes we have no cached child for are hubs: the host only
/// adds us to other stacks when a hub asked for it. Probing failures
/// decline filtering.
pub fn select(ctx: &ControlDevice, node: NativeHandle) -> StrategyKind {
    let platform = ctx.platform();
    let device_id = match platform.device_id(node) {
        Ok(id) => id,
        Err(e) => {
            warn!("Cannot query device ID of {}: {}", node, e);
            return StrategyKind::Null;
        }
    };

    if ROOT_HUB_IDS
        .iter()
        .any(|root| root.eq_ignore_ascii_case(&device_id))
    {
        debug!("{} is a root hub", device_id);
        return StrategyKind::Hub;
    }

    if !is_usb_device_id(&device_id) {
        debug!("{} is not a USB device, not filtering", device_id);
        return StrategyKind::Null;
    }

    let instance_id = match platform.instance_id(node) {
        Ok(id) => id,
        Err(e) => {
            warn!("Cannot query instance ID of {}: {}", node, e);
            return StrategyKind::Null;
        }
    };
    let id = DeviceId::new(device_id, instance_id);

    let Some(child) = ctx.registry().find_child(&id) else {
        if id.device_id.eq_ignore_ascii_case(FAILED_ENUMERATION_ID) {
            debug!("{} failed enumeration, not filtering", id);
            return StrategyKind::Null;
        }
        debug!("No cached descriptor for {}, treating as hub", id);
        return StrategyKind::Hub;
    };

    if child.descriptor().is_hub() {
        return StrategyKind::Hub;
    }

    if ctx.registry().should_redirect(&id) {
        return StrategyKind::Redirector;
    }

    if ctx.rules().should_hide(child.descriptor(), child.classes()) {
        return StrategyKind::Hider;
    }

    let decision = ctx
        .rules()
        .should_raw_filter(child.device_id(), child.location_id(), true);
    if let Some(key_path) = decision.reinstall_key {
        child.set_raw_device_to_reinstall(key_path);
    }
    if decision.raw_filter {
        return StrategyKind::RawFilter;
    }

    debug!("Nothing to do for {}, not filtering", id);
    StrategyKind::Null
}
