//! Function-driver presence rules
//!
//! The OS keeps one enumeration key per VID/PID and instance, recording
//! where the device was last plugged in and which function driver (if any)
//! was installed for it. Scanning those keys gives a "last known" answer to
//! "does this device have a driver?" without touching the device itself.

use crate::store::{RegistryStore, StorageError, StorageResult, join_key};
use common::ids::{port_hub_from_location, vid_pid_from_key_name, wildcard_match};
use tracing::{debug, trace};

pub const DEVICE_KEY_PATTERN: &str = "VID_????&PID_????";
pub const LOCATION_PATTERN: &str = "Port_#????.Hub_#????";
pub const LOCATION_VALUE: &str = "LocationInformation";
pub const DRIVER_VALUE: &str = "Driver";
pub const CONFIG_FLAGS_VALUE: &str = "ConfigFlags";

/// Makes the OS look for a function driver again on the next plug-in
pub const CONFIGFLAG_REINSTALL: u32 = 0x0000_0020;

const MAX_LOCATION_LEN: usize = 20;

/// Last known driver state of a VID/PID on a given port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverPresenceRule {
    /// `vid << 16 | pid`
    pub vid_pid: u32,
    /// `port << 16 | hub`
    pub port_hub: u32,
    /// Enumeration key holding the `Driver` value
    pub key_path: String,
}

impl DriverPresenceRule {
    pub fn matches(&self, vid_pid: u32, port_hub: u32) -> bool {
        self.vid_pid == vid_pid && self.port_hub == port_hub
    }
}

/// Build the rule list from the enumeration keys under `enum_root`
///
/// Keys that do not follow the expected layout are skipped.
pub fn scan(store: &dyn RegistryStore, enum_root: &str) -> StorageResult<Vec<DriverPresenceRule>> {
    let mut rules = Vec::new();

    for device_key in store.subkeys(enum_root)? {
        if !wildcard_match(DEVICE_KEY_PATTERN, &device_key) {
            continue;
        }
        let Ok(vid_pid) = vid_pid_from_key_name(&device_key) else {
            continue;
        };

        let device_path = join_key(enum_root, &device_key);
        let instances = match store.subkeys(&device_path) {
            Ok(instances) => instances,
            Err(e) => {
                debug!("Skipping {}: {}", device_path, e);
                continue;
            }
        };

        for instance in instances {
            let instance_path = join_key(&device_path, &instance);
            let location = match store.read_string(&instance_path, LOCATION_VALUE) {
                Ok(location) => location,
                Err(e) => {
                    trace!("No location for {}: {}", instance_path, e);
                    continue;
                }
            };

            if location.len() > MAX_LOCATION_LEN || !wildcard_match(LOCATION_PATTERN, &location) {
                continue;
            }
            let Ok(port_hub) = port_hub_from_location(&location) else {
                continue;
            };

            rules.push(DriverPresenceRule {
                vid_pid,
                port_hub,
                key_path: instance_path,
            });
        }
    }

    Ok(rules)
}

/// Outcome of looking a device up in the rule list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverProbe {
    /// No usable entry for this VID/PID on this port
    NoEntry,
    /// Entry found and its key is readable
    Entry { key_path: String, has_driver: bool },
}

/// Look up the first matching rule and read its `Driver` value
///
/// An entry whose key cannot be opened counts as no entry.
pub fn probe(
    rules: &[DriverPresenceRule],
    store: &dyn RegistryStore,
    vid_pid: u32,
    port_hub: u32,
) -> DriverProbe {
    let Some(rule) = rules.iter().find(|rule| rule.matches(vid_pid, port_hub)) else {
        return DriverProbe::NoEntry;
    };

    match has_driver(store, &rule.key_path) {
        Some(has_driver) => DriverProbe::Entry {
            key_path: rule.key_path.clone(),
            has_driver,
        },
        None => {
            debug!("Failed to open driver key {}", rule.key_path);
            DriverProbe::NoEntry
        }
    }
}

/// `Some(true)` if `key_path` holds a `Driver` value, `None` if the key
/// itself cannot be read
pub fn has_driver(store: &dyn RegistryStore, key_path: &str) -> Option<bool> {
    match store.read_value(key_path, DRIVER_VALUE) {
        Ok(_) => Some(true),
        Err(StorageError::KeyNotFound(_)) | Err(StorageError::Unavailable(_)) => None,
        Err(_) => Some(false),
    }
}

/// Set the reinstall flag in the key's `ConfigFlags` DWORD
pub fn mark_reinstall(store: &dyn RegistryStore, key_path: &str) -> StorageResult<()> {
    let flags = store.read_dword(key_path, CONFIG_FLAGS_VALUE)?;
    store.write_value(
        key_path,
        CONFIG_FLAGS_VALUE,
        crate::store::RegValue::Dword(flags | CONFIGFLAG_REINSTALL),
    )
}
