//! Child devices enumerated under a hub
//!
//! A [`ChildDevice`] caches everything the filter learned about a device
//! node when it first appeared on a hub's bus relations: identity strings,
//! descriptors and the derived class mask used by extended hide rules.

pub mod registry;

use crate::platform::NativeHandle;
use crate::rules::RuleStore;
use parking_lot::Mutex;
use protocol::{DeviceDescriptor, DeviceId, DeviceInfo, DeviceSpeed};
use tracing::{debug, info, warn};

pub use registry::DeviceRegistry;

pub const USB_CLASS_AUDIO: u8 = 0x01;
pub const USB_CLASS_COMMUNICATIONS: u8 = 0x02;
pub const USB_CLASS_HID: u8 = 0x03;
pub const USB_CLASS_PRINTER: u8 = 0x07;
pub const USB_CLASS_STORAGE: u8 = 0x08;
pub const USB_CLASS_HUB: u8 = 0x09;
pub const USB_CLASS_CDC_DATA: u8 = 0x0A;
pub const USB_CLASS_VIDEO: u8 = 0x0E;
pub const USB_CLASS_AUDIO_VIDEO: u8 = 0x10;
pub const USB_CLASS_WIRELESS_CONTROLLER: u8 = 0xE0;

const DESCRIPTOR_TYPE_INTERFACE: u8 = 0x04;
const UNKNOWN_CLASS_BIT: u32 = 1 << 31;

const fn class_bit(class: u8) -> u32 {
    1 << class
}

/// Class mask bit(s) contributed by one device or interface class code
pub fn class_mask(class: u8) -> u32 {
    match class {
        USB_CLASS_AUDIO => class_bit(USB_CLASS_AUDIO),
        USB_CLASS_COMMUNICATIONS | USB_CLASS_CDC_DATA | USB_CLASS_WIRELESS_CONTROLLER => {
            class_bit(USB_CLASS_COMMUNICATIONS)
        }
        USB_CLASS_PRINTER => class_bit(USB_CLASS_PRINTER),
        USB_CLASS_STORAGE => class_bit(USB_CLASS_STORAGE),
        USB_CLASS_VIDEO => class_bit(USB_CLASS_VIDEO),
        USB_CLASS_AUDIO_VIDEO => class_bit(USB_CLASS_AUDIO) | class_bit(USB_CLASS_VIDEO),
        USB_CLASS_HUB => class_bit(USB_CLASS_HUB),
        USB_CLASS_HID => class_bit(USB_CLASS_HID),
        _ => UNKNOWN_CLASS_BIT,
    }
}

/// Interface class codes found in a raw configuration descriptor
///
/// Walks the descriptor chain up to `wTotalLength`, stopping at the first
/// malformed entry.
pub fn interface_classes(config: &[u8]) -> Vec<u8> {
    let total = match config {
        [_, _, lo, hi, ..] => usize::from(u16::from_le_bytes([*lo, *hi])).min(config.len()),
        _ => return Vec::new(),
    };

    let mut classes = Vec::new();
    let mut offset = 0;
    while offset + 2 <= total {
        let length = usize::from(config[offset]);
        if length == 0 || offset + length > total {
            break;
        }
        if config[offset + 1] == DESCRIPTOR_TYPE_INTERFACE && length >= 6 {
            classes.push(config[offset + 5]);
        }
        offset += length;
    }
    classes
}

/// Derive the extended-rule class mask of a device
///
/// Collects the bits of the device class (when set) and of every
/// interface, then keeps a single determinative type: printer, else
/// communications, else the audio/video subset.
pub fn device_classes(descriptor: &DeviceDescriptor, configs: &[Vec<u8>]) -> u32 {
    let mut mask = 0;
    if descriptor.device_class != 0 {
        mask |= class_mask(descriptor.device_class);
    }
    for config in configs {
        for class in interface_classes(config) {
            mask |= class_mask(class);
        }
    }

    let audio_video = class_bit(USB_CLASS_AUDIO) | class_bit(USB_CLASS_VIDEO);
    if mask & class_bit(USB_CLASS_PRINTER) != 0 {
        class_bit(USB_CLASS_PRINTER)
    } else if mask & class_bit(USB_CLASS_COMMUNICATIONS) != 0 {
        class_bit(USB_CLASS_COMMUNICATIONS)
    } else if mask & audio_video != 0 {
        mask & audio_video
    } else {
        mask
    }
}

/// Identity gathered by probing a new bus relation
#[derive(Debug, Clone)]
pub struct ProbedIdentity {
    pub id: DeviceId,
    pub location_id: String,
    pub node: NativeHandle,
    pub port: u32,
    pub speed: DeviceSpeed,
    pub descriptor: DeviceDescriptor,
    pub config_descriptors: Vec<Vec<u8>>,
}

#[derive(Debug, Default)]
struct RawState {
    /// Enumeration key recorded when the driver scan found no driver
    hw_key_path: Option<String>,
    checked: bool,
    really_raw: bool,
    raw_configuration: u8,
}

/// One device node known to a hub filter
#[derive(Debug)]
pub struct ChildDevice {
    identity: ProbedIdentity,
    parent_id: u32,
    classes: u32,
    raw: Mutex<RawState>,
}

impl ChildDevice {
    pub fn new(parent_id: u32, identity: ProbedIdentity) -> Self {
        let classes = device_classes(&identity.descriptor, &identity.config_descriptors);
        debug!("Class mask of {}: {:#010x}", identity.id, classes);
        Self {
            identity,
            parent_id,
            classes,
            raw: Mutex::new(RawState::default()),
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.identity.id
    }

    pub fn device_id(&self) -> &str {
        &self.identity.id.device_id
    }

    pub fn instance_id(&self) -> &str {
        &self.identity.id.instance_id
    }

    pub fn location_id(&self) -> &str {
        &self.identity.location_id
    }

    pub fn node(&self) -> NativeHandle {
        self.identity.node
    }

    /// Instance number of the hub filter owning this device
    pub fn parent_id(&self) -> u32 {
        self.parent_id
    }

    pub fn port(&self) -> u32 {
        self.identity.port
    }

    pub fn speed(&self) -> DeviceSpeed {
        self.identity.speed
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.identity.descriptor
    }

    pub fn classes(&self) -> u32 {
        self.classes
    }

    pub fn configuration_count(&self) -> usize {
        self.identity.config_descriptors.len()
    }

    /// Cached configuration descriptor, `None` past the last index
    pub fn configuration_descriptor(&self, index: u8) -> Option<&[u8]> {
        self.identity
            .config_descriptors
            .get(usize::from(index))
            .map(Vec::as_slice)
    }

    pub fn matches(&self, id: &DeviceId) -> bool {
        self.identity.id == *id
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.identity.id.clone(),
            filter_id: self.parent_id,
            port: self.identity.port,
            speed: self.identity.speed,
            descriptor: self.identity.descriptor,
        }
    }

    /// Remember the enumeration key of a device that looks driverless
    pub fn set_raw_device_to_reinstall(&self, key_path: String) {
        debug!("{} is probably raw, key {}", self.identity.id, key_path);
        self.raw.lock().hw_key_path = Some(key_path);
    }

    pub fn is_probably_raw(&self) -> bool {
        self.raw.lock().hw_key_path.is_some()
    }

    /// Confirm on first call whether a probably-raw device still has no
    /// function driver; later calls return the cached answer
    pub fn if_really_raw(&self, rules: &RuleStore) -> bool {
        let key_path = {
            let mut raw = self.raw.lock();
            if raw.checked {
                return raw.really_raw;
            }
            raw.checked = true;
            match raw.hw_key_path.clone() {
                Some(path) => path,
                None => return raw.really_raw,
            }
        };

        let verdict = rules.has_driver(&key_path).map(|has_driver| !has_driver);
        let mut raw = self.raw.lock();
        match verdict {
            Some(really_raw) => raw.really_raw = really_raw,
            None => debug!("Cannot open {}, keeping raw verdict", key_path),
        }
        debug!("{} really raw: {}", self.identity.id, raw.really_raw);
        raw.really_raw
    }

    /// Ask the OS to look for a driver again next time the device appears
    pub fn mark_raw_device_to_reinstall(&self, rules: &RuleStore) {
        let Some(key_path) = self.raw.lock().hw_key_path.clone() else {
            return;
        };
        match rules.mark_reinstall(&key_path) {
            Ok(()) => info!("{} marked for driver reinstall", self.identity.id),
            Err(e) => warn!("Failed to mark {} for reinstall: {}", self.identity.id, e),
        }
    }

    /// Configuration last selected on the raw device, 0 if none
    pub fn raw_configuration(&self) -> u8 {
        self.raw.lock().raw_configuration
    }

    pub fn set_raw_configuration(&self, configuration: u8) {
        self.raw.lock().raw_configuration = configuration;
    }
}
