//! Rule store
//!
//! Holds the hide-rule sets and the driver-presence list, and answers the
//! two classification questions asked about every new device: should it be
//! hidden, and does it need the raw filter.
//!
//! Both collections sit behind their own short-lived locks. Reads from the
//! durable store always happen with no lock held; results are swapped in
//! afterwards.

pub mod driver;
pub mod hide;

use crate::error::{FilterError, Result};
use crate::store::{RegistryStore, StorageError, join_key};
use common::ids::{port_hub_from_location, vid_pid_from_device_id};
use driver::{DriverPresenceRule, DriverProbe};
use hide::{HideRule, HideRuleSets, Mask, RuleFamily, RuleLifetime};
use parking_lot::Mutex;
use protocol::{DeviceDescriptor, HideRuleRequest};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use driver::CONFIGFLAG_REINSTALL;

/// Value names of a stored hide rule
const VALUE_SHOULD_HIDE: &str = "ShouldHide";
const VALUE_TYPE: &str = "Type";
const VALUE_VID: &str = "VID";
const VALUE_PID: &str = "PID";
const VALUE_BCD: &str = "BCD";
const VALUE_CLASS: &str = "Class";
const VALUE_FORCE: &str = "ForceDecision";

/// Store locations the rule store reads
#[derive(Debug, Clone)]
pub struct RuleKeys {
    /// Parent key of the persistent hide rules, one subkey per rule
    pub hide_rules_key: String,
    /// Root of the OS device enumeration keys
    pub enum_root: String,
}

/// Result of the raw-filter question for one device
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawFilterDecision {
    pub raw_filter: bool,
    /// Set on the second probe when the device's enumeration key has no
    /// driver; the device is then "probably raw"
    pub reinstall_key: Option<String>,
}

pub struct RuleStore {
    store: Arc<dyn RegistryStore>,
    keys: RuleKeys,
    hide_rules: Mutex<HideRuleSets>,
    /// `None` until the first scan
    drivers: Mutex<Option<Arc<Vec<DriverPresenceRule>>>>,
}

impl RuleStore {
    pub fn new(store: Arc<dyn RegistryStore>, keys: RuleKeys) -> Self {
        Self {
            store,
            keys,
            hide_rules: Mutex::new(HideRuleSets::default()),
            drivers: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<dyn RegistryStore> {
        &self.store
    }

    pub fn should_hide(&self, desc: &DeviceDescriptor, classes: u32) -> bool {
        let hide = self.hide_rules.lock().should_hide(desc, classes);
        debug!(
            "Hide decision for {:04x}:{:04x} (classes {:#010x}): {}",
            desc.vendor_id, desc.product_id, classes, hide
        );
        hide
    }

    pub fn add_rule(&self, request: &HideRuleRequest, lifetime: RuleLifetime) -> Result<()> {
        let (family, rule) = HideRule::from_request(request)?;
        self.insert(family, lifetime, rule)
    }

    fn insert(&self, family: RuleFamily, lifetime: RuleLifetime, rule: HideRule) -> Result<()> {
        info!("Adding {:?} {:?} hide rule: {}", lifetime, family, rule);
        self.hide_rules.lock().set_mut(family, lifetime).add(rule)
    }

    /// Drop every dynamic rule of both families
    pub fn clear_rules(&self) {
        self.hide_rules.lock().clear_dynamic();
        info!("All dynamic hide rules dropped");
    }

    pub fn rule_count(&self) -> usize {
        self.hide_rules.lock().len()
    }

    /// Replace the persistent rules with those found in storage
    ///
    /// A missing rules key means "no persistent rules". Unreadable rule
    /// subkeys are skipped.
    pub fn reload_persistent_rules(&self) -> Result<usize> {
        let loaded = self.read_stored_rules();

        let mut sets = self.hide_rules.lock();
        sets.clear_persistent();
        let rules = match loaded {
            Ok(rules) => rules,
            Err(e) if e.is_not_found() => {
                debug!("No persistent hide rules at {}", self.keys.hide_rules_key);
                return Ok(0);
            }
            Err(e) => return Err(FilterError::Storage(e)),
        };

        let mut added = 0;
        for (family, rule) in rules {
            match sets.set_mut(family, RuleLifetime::Persistent).add(rule) {
                Ok(()) => added += 1,
                Err(e) => warn!("Skipping persistent hide rule: {}", e),
            }
        }
        info!("Loaded {} persistent hide rules", added);
        Ok(added)
    }

    fn read_stored_rules(&self) -> std::result::Result<Vec<(RuleFamily, HideRule)>, StorageError> {
        let root = &self.keys.hide_rules_key;
        let mut rules = Vec::new();
        for name in self.store.subkeys(root)? {
            let path = join_key(root, &name);
            match self.read_stored_rule(&path) {
                Ok(Some(rule)) => rules.push(rule),
                Ok(None) => {}
                Err(e) => warn!("Failed to read hide rule {}: {}", path, e),
            }
        }
        Ok(rules)
    }

    fn read_stored_rule(
        &self,
        path: &str,
    ) -> std::result::Result<Option<(RuleFamily, HideRule)>, StorageError> {
        let store = self.store.as_ref();
        let hide = store.read_dword(path, VALUE_SHOULD_HIDE)? != 0;
        let rule_type = store.read_dword(path, VALUE_TYPE)?;
        let vid = Mask::from_stored(store.read_dword(path, VALUE_VID)?);
        let pid = Mask::from_stored(store.read_dword(path, VALUE_PID)?);
        let bcd = Mask::from_stored(store.read_dword(path, VALUE_BCD)?);
        let class = Mask::from_stored(store.read_dword(path, VALUE_CLASS)?);
        let force_decision = match store.read_dword(path, VALUE_FORCE) {
            Ok(v) => v != 0,
            Err(e) if e.is_not_found() => !hide,
            Err(e) => return Err(e),
        };

        let Ok(family) = RuleFamily::from_tag(rule_type) else {
            warn!("Ignoring hide rule {} with unknown type {}", path, rule_type);
            return Ok(None);
        };

        Ok(Some((
            family,
            HideRule {
                hide,
                class,
                vid,
                pid,
                bcd,
                force_decision,
            },
        )))
    }

    /// Drop dynamic rules and reload persistent ones
    pub fn rescan(&self) -> Result<usize> {
        self.clear_rules();
        self.reload_persistent_rules()
    }

    /// Rebuild the driver-presence list and swap it in
    pub fn reload_driver_list(&self) -> usize {
        let rules = match driver::scan(self.store.as_ref(), &self.keys.enum_root) {
            Ok(rules) => rules,
            Err(e) => {
                warn!("Driver presence scan of {} failed: {}", self.keys.enum_root, e);
                Vec::new()
            }
        };
        let count = rules.len();
        *self.drivers.lock() = Some(Arc::new(rules));
        debug!("Driver presence list rebuilt with {} entries", count);
        count
    }

    fn driver_list(&self) -> Arc<Vec<DriverPresenceRule>> {
        if let Some(list) = self.drivers.lock().clone() {
            return list;
        }
        self.reload_driver_list();
        self.drivers.lock().clone().unwrap_or_default()
    }

    /// Decide whether a device needs the raw filter
    ///
    /// A device with no usable presence entry is assumed to have no driver,
    /// so a first plug-in works. On the first probe a missing entry triggers
    /// one rescan before that default applies.
    pub fn should_raw_filter(
        &self,
        device_id: &str,
        location_id: &str,
        second_probe: bool,
    ) -> RawFilterDecision {
        let vid_pid = match vid_pid_from_device_id(device_id) {
            Ok(v) => v,
            Err(e) => {
                debug!("No raw filter for {}: {}", device_id, e);
                return RawFilterDecision::default();
            }
        };
        let port_hub = match port_hub_from_location(location_id) {
            Ok(v) => v,
            Err(e) => {
                debug!("No raw filter for {} at '{}': {}", device_id, location_id, e);
                return RawFilterDecision::default();
            }
        };

        let store = self.store.as_ref();
        let mut result = driver::probe(&self.driver_list(), store, vid_pid, port_hub);
        if result == DriverProbe::NoEntry && !second_probe {
            self.reload_driver_list();
            result = driver::probe(&self.driver_list(), store, vid_pid, port_hub);
        }

        let decision = match result {
            DriverProbe::NoEntry => RawFilterDecision {
                raw_filter: true,
                reinstall_key: None,
            },
            DriverProbe::Entry {
                key_path,
                has_driver,
            } => RawFilterDecision {
                raw_filter: !has_driver,
                reinstall_key: (second_probe && !has_driver).then_some(key_path),
            },
        };
        debug!(
            "Raw filter decision for {:#010x} at {:#010x} (second probe {}): {:?}",
            vid_pid, port_hub, second_probe, decision
        );
        decision
    }

    /// Re-read the `Driver` value of a probably-raw device's key
    pub fn has_driver(&self, key_path: &str) -> Option<bool> {
        driver::has_driver(self.store.as_ref(), key_path)
    }

    pub fn mark_reinstall(&self, key_path: &str) -> Result<()> {
        driver::mark_reinstall(self.store.as_ref(), key_path)?;
        info!("Reinstall flag set on {}", key_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, RegValue};
    use common::test_utils::create_mock_descriptor;

    const DEVICE: &str = "USB\\VID_1234&PID_5678";
    const LOCATION: &str = "Port_#0001.Hub_#0002";

    fn rule_store(store: Arc<MemoryStore>) -> RuleStore {
        RuleStore::new(
            store,
            RuleKeys {
                hide_rules_key: "Parameters\\HideRules".into(),
                enum_root: "Enum\\USB".into(),
            },
        )
    }

    fn store_rule(store: &MemoryStore, name: &str, vid: u32, hide: u32, rule_type: u32) {
        let path = format!("Parameters\\HideRules\\{}", name);
        store.set_value(&path, VALUE_SHOULD_HIDE, RegValue::Dword(hide));
        store.set_value(&path, VALUE_TYPE, RegValue::Dword(rule_type));
        store.set_value(&path, VALUE_VID, RegValue::Dword(vid));
        store.set_value(&path, VALUE_PID, RegValue::Dword(0xFFFF_FFFF));
        store.set_value(&path, VALUE_BCD, RegValue::Dword(0xFFFF_FFFF));
        store.set_value(&path, VALUE_CLASS, RegValue::Dword(0xFFFF_FFFF));
    }

    #[test]
    fn test_hide_scenario_add_then_clear() {
        let rules = rule_store(Arc::new(MemoryStore::new()));
        let desc = create_mock_descriptor(1, 2);

        let request = HideRuleRequest::for_device(1, 2, true).with_force(true);
        rules.add_rule(&request, RuleLifetime::Dynamic).unwrap();
        assert!(rules.should_hide(&desc, 0));

        assert!(matches!(
            rules.add_rule(&request, RuleLifetime::Dynamic),
            Err(FilterError::AlreadyExists(_))
        ));

        rules.clear_rules();
        assert!(!rules.should_hide(&desc, 0));
    }

    #[test]
    fn test_reload_persistent_rules() {
        let store = Arc::new(MemoryStore::new());
        store_rule(&store, "a", 0x1234, 1, 0);
        store_rule(&store, "b", 0x1111, 1, 1);
        store_rule(&store, "bad-type", 0x2222, 1, 9);
        store.create_key("Parameters\\HideRules\\incomplete");

        let rules = rule_store(store.clone());
        assert_eq!(rules.reload_persistent_rules().unwrap(), 2);
        assert!(rules.should_hide(&create_mock_descriptor(0x1234, 1), 0));

        // Persistent rules survive ClearRules, and are replaced on reload
        rules.clear_rules();
        assert_eq!(rules.rule_count(), 2);
        store.delete_key("Parameters\\HideRules\\a");
        assert_eq!(rules.reload_persistent_rules().unwrap(), 1);
        assert!(!rules.should_hide(&create_mock_descriptor(0x1234, 1), 0));
    }

    #[test]
    fn test_missing_rules_key_is_success() {
        let rules = rule_store(Arc::new(MemoryStore::new()));
        assert_eq!(rules.reload_persistent_rules().unwrap(), 0);
    }

    #[test]
    fn test_rescan_clears_dynamic_rules() {
        let store = Arc::new(MemoryStore::new());
        store_rule(&store, "a", 0x1234, 1, 0);
        let rules = rule_store(store);
        rules
            .add_rule(
                &HideRuleRequest::for_device(9, 9, true),
                RuleLifetime::Dynamic,
            )
            .unwrap();
        assert_eq!(rules.rescan().unwrap(), 1);
        assert_eq!(rules.rule_count(), 1);
    }

    #[test]
    fn test_raw_filter_defaults_to_raw_without_entries() {
        let rules = rule_store(Arc::new(MemoryStore::new()));
        let first = rules.should_raw_filter(DEVICE, LOCATION, false);
        assert!(first.raw_filter);
        assert_eq!(first.reinstall_key, None);
    }

    #[test]
    fn test_raw_filter_skips_unparsable_identity() {
        let rules = rule_store(Arc::new(MemoryStore::new()));
        assert!(!rules.should_raw_filter("USB\\ROOT_HUB30", LOCATION, false).raw_filter);
        assert!(!rules.should_raw_filter(DEVICE, "0000.0014", false).raw_filter);
    }

    #[test]
    fn test_raw_filter_with_driver_entry() {
        let store = Arc::new(MemoryStore::new());
        let key = "Enum\\USB\\VID_1234&PID_5678\\6&1";
        store.set_value(key, "LocationInformation", RegValue::String(LOCATION.into()));
        store.set_value(key, "Driver", RegValue::String("{guid}\\0001".into()));
        let rules = rule_store(store.clone());

        let decision = rules.should_raw_filter(DEVICE, LOCATION, true);
        assert!(!decision.raw_filter);
        assert_eq!(decision.reinstall_key, None);
    }

    #[test]
    fn test_raw_filter_marks_driverless_entry_on_second_probe() {
        let store = Arc::new(MemoryStore::new());
        let key = "Enum\\USB\\VID_1234&PID_5678\\6&1";
        store.set_value(key, "LocationInformation", RegValue::String(LOCATION.into()));
        let rules = rule_store(store);

        let first = rules.should_raw_filter(DEVICE, LOCATION, false);
        assert!(first.raw_filter);
        assert_eq!(first.reinstall_key, None);

        let second = rules.should_raw_filter(DEVICE, LOCATION, true);
        assert!(second.raw_filter);
        assert_eq!(second.reinstall_key.as_deref(), Some(key));
    }

    #[test]
    fn test_first_probe_rescans_for_new_entries() {
        let store = Arc::new(MemoryStore::new());
        let rules = rule_store(store.clone());
        rules.reload_driver_list();

        let key = "Enum\\USB\\VID_1234&PID_5678\\6&1";
        store.set_value(key, "LocationInformation", RegValue::String(LOCATION.into()));
        store.set_value(key, "Driver", RegValue::String("{guid}\\0001".into()));

        // Second probes use the cached list only
        assert!(rules.should_raw_filter(DEVICE, LOCATION, true).raw_filter);
        assert!(!rules.should_raw_filter(DEVICE, LOCATION, false).raw_filter);
    }

    #[test]
    fn test_mark_reinstall() {
        let store = Arc::new(MemoryStore::new());
        store.set_value("K", "ConfigFlags", RegValue::Dword(0));
        let rules = rule_store(store.clone());
        rules.mark_reinstall("K").unwrap();
        assert_eq!(
            store.read_dword("K", "ConfigFlags").unwrap(),
            CONFIGFLAG_REINSTALL
        );
        assert!(rules.mark_reinstall("Missing").is_err());
    }
}
