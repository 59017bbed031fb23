//! Device registry
//!
//! The authoritative, thread-safe view of the hub filters (and through
//! them every enumerated child), the hidden devices with their serial
//! numbers, and the redirection table. Each collection has its own lock;
//! the only nesting is hub list before a hub's child list.

use crate::device::ChildDevice;
use crate::error::{FilterError, Result};
use crate::filter_device::FilterDevice;
use crate::platform::NativeHandle;
use crate::redirection::Redirection;
use crate::strategy::HubStrategy;
use parking_lot::Mutex;
use protocol::{DeviceId, DeviceInfo, ProcessId};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
struct HiddenDevice {
    instance: u32,
    serial: u32,
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    hubs: Mutex<Vec<Arc<FilterDevice>>>,
    hidden: Mutex<Vec<HiddenDevice>>,
    redirections: Mutex<Vec<Arc<Redirection>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register_filter(&self, filter: Arc<FilterDevice>) {
        debug!("Registering hub filter {}", filter.instance());
        self.hubs.lock().push(filter);
    }

    pub(crate) fn unregister_filter(&self, instance: u32) {
        self.hubs.lock().retain(|hub| hub.instance() != instance);
    }

    pub fn hub_count(&self) -> usize {
        self.hubs.lock().len()
    }

    fn find_in_hubs<T>(
        &self,
        mut f: impl FnMut(&HubStrategy) -> Option<T>,
    ) -> Option<T> {
        self.hubs
            .lock()
            .iter()
            .filter_map(|filter| filter.as_hub())
            .find_map(|hub| f(hub))
    }

    pub fn count_devices(&self) -> usize {
        self.hubs
            .lock()
            .iter()
            .filter_map(|filter| filter.as_hub())
            .map(|hub| hub.child_count())
            .sum()
    }

    /// Snapshot every live child
    ///
    /// Fails as a whole with `BufferTooSmall` when there are more devices
    /// than `capacity`.
    pub fn enumerate(&self, capacity: usize) -> Result<Vec<DeviceInfo>> {
        let devices: Vec<DeviceInfo> = {
            let hubs = self.hubs.lock();
            hubs.iter()
                .filter_map(|filter| filter.as_hub())
                .flat_map(|hub| {
                    hub.with_children(|children| {
                        children.iter().map(|child| child.info()).collect::<Vec<_>>()
                    })
                })
                .collect()
        };

        if devices.len() > capacity {
            return Err(FilterError::BufferTooSmall {
                needed: devices.len(),
                capacity,
            });
        }
        Ok(devices)
    }

    pub fn find_child(&self, id: &DeviceId) -> Option<Arc<ChildDevice>> {
        self.find_in_hubs(|hub| hub.find(id))
    }

    pub fn find_child_by_node(&self, node: NativeHandle) -> Option<Arc<ChildDevice>> {
        self.find_in_hubs(|hub| hub.find_by_node(node))
    }

    pub fn device_exists(&self, id: &DeviceId) -> bool {
        self.find_child(id).is_some()
    }

    /// Add a hidden or raw-filtered device and give it the smallest free
    /// serial number
    pub(crate) fn register_hidden_device(&self, instance: u32) -> u32 {
        let mut hidden = self.hidden.lock();
        let mut serial = 0;
        while hidden.iter().any(|device| device.serial == serial) {
            serial += 1;
        }
        hidden.push(HiddenDevice { instance, serial });
        debug!("Filter {} got serial number {}", instance, serial);
        serial
    }

    /// Release a device's serial number
    pub(crate) fn unregister_hidden_device(&self, instance: u32) -> Option<u32> {
        let mut hidden = self.hidden.lock();
        let position = hidden.iter().position(|device| device.instance == instance)?;
        Some(hidden.remove(position).serial)
    }

    pub fn hidden_count(&self) -> usize {
        self.hidden.lock().len()
    }

    /// Serial numbers currently held, in registration order
    pub fn hidden_serials(&self) -> Vec<u32> {
        self.hidden.lock().iter().map(|device| device.serial).collect()
    }

    /// Register the intent to redirect a live device
    pub fn add_redirection(&self, id: &DeviceId) -> Result<Arc<Redirection>> {
        if !self.device_exists(id) {
            return Err(FilterError::NotFound(id.to_string()));
        }

        let mut redirections = self.redirections.lock();
        if redirections.iter().any(|r| r.id() == id) {
            return Err(FilterError::AlreadyExists(id.to_string()));
        }
        let redirection = Arc::new(Redirection::new(id.clone()));
        redirections.push(redirection.clone());
        info!("Redirection for {} registered", id);
        Ok(redirection)
    }

    pub fn remove_redirection(&self, id: &DeviceId) -> Result<Arc<Redirection>> {
        let mut redirections = self.redirections.lock();
        let position = redirections
            .iter()
            .position(|r| r.id() == id)
            .ok_or_else(|| FilterError::NotFound(id.to_string()))?;
        Ok(redirections.remove(position))
    }

    /// Run `f` on the redirection for `id` under the table lock
    ///
    /// With `pid` set, only a redirection owned by that process (or any
    /// redirection for `ProcessId::ANY`) is considered.
    pub fn modify_redirection<R>(
        &self,
        id: &DeviceId,
        pid: Option<ProcessId>,
        f: impl FnOnce(&Redirection) -> R,
    ) -> Result<R> {
        let redirections = self.redirections.lock();
        redirections
            .iter()
            .find(|r| r.id() == id && pid.is_none_or(|pid| r.matches_process(pid)))
            .map(|r| f(r))
            .ok_or_else(|| FilterError::NotFound(id.to_string()))
    }

    pub fn find_redirection(&self, id: &DeviceId) -> Option<Arc<Redirection>> {
        self.redirections
            .lock()
            .iter()
            .find(|r| r.id() == id)
            .cloned()
    }

    pub fn redirection_count(&self) -> usize {
        self.redirections.lock().len()
    }

    /// A redirection is pending for `id` and not being torn down
    pub fn should_redirect(&self, id: &DeviceId) -> bool {
        self.modify_redirection(id, None, |r| !r.is_prepared_for_remove())
            .unwrap_or(false)
    }

    /// Bind the redirector filter created for `id` to its redirection
    pub(crate) fn notify_redirector_attached(&self, id: &DeviceId, filter: Arc<FilterDevice>) -> bool {
        self.modify_redirection(id, None, |r| r.notify_redirector_created(filter))
            .is_ok()
    }

    pub(crate) fn notify_redirection_removed(&self, id: &DeviceId) {
        if self
            .modify_redirection(id, None, Redirection::notify_redirection_removed)
            .is_err()
        {
            debug!("No redirection to notify for {}", id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ProbedIdentity;
    use crate::strategy::Strategy;
    use common::test_utils::{create_mock_descriptor, create_mock_device_id, create_mock_location};
    use protocol::DeviceSpeed;

    fn child(hub: u32, vid: u16, instance: u32) -> ChildDevice {
        ChildDevice::new(
            hub,
            ProbedIdentity {
                id: create_mock_device_id(vid, 0x0001, instance),
                location_id: create_mock_location(instance as u16, 1),
                node: NativeHandle(u64::from(vid) << 8 | u64::from(instance)),
                port: instance,
                speed: DeviceSpeed::Full,
                descriptor: create_mock_descriptor(vid, 0x0001),
                config_descriptors: Vec::new(),
            },
        )
    }

    fn registry_with(children: Vec<ChildDevice>) -> DeviceRegistry {
        let registry = DeviceRegistry::new();
        let hub = Arc::new(FilterDevice::new(
            1,
            NativeHandle(0x100),
            Strategy::Hub(HubStrategy::new()),
        ));
        for child in children {
            assert!(hub.as_hub().unwrap().insert_child(Arc::new(child)));
        }
        registry.register_filter(hub);
        registry
    }

    #[test]
    fn test_enumerate_capacity() {
        let registry = registry_with(vec![child(1, 0x10, 1), child(1, 0x20, 2)]);
        assert_eq!(registry.count_devices(), 2);

        let devices = registry.enumerate(2).unwrap();
        assert_eq!(devices.len(), 2);
        assert!(devices.iter().all(|d| d.filter_id == 1));

        assert!(matches!(
            registry.enumerate(1),
            Err(FilterError::BufferTooSmall {
                needed: 2,
                capacity: 1
            })
        ));
    }

    #[test]
    fn test_lookup() {
        let registry = registry_with(vec![child(1, 0x10, 1)]);
        let id = create_mock_device_id(0x10, 0x0001, 1);
        let found = registry.find_child(&id).unwrap();
        assert_eq!(found.node(), NativeHandle(0x1001));
        assert!(registry.find_child_by_node(NativeHandle(0x1001)).is_some());
        assert!(registry.find_child_by_node(NativeHandle(0x9999)).is_none());
        assert!(!registry.device_exists(&create_mock_device_id(0x10, 0x0001, 2)));
    }

    #[test]
    fn test_serial_numbers_reused() {
        let registry = DeviceRegistry::new();
        assert_eq!(registry.register_hidden_device(10), 0);
        assert_eq!(registry.register_hidden_device(11), 1);
        assert_eq!(registry.register_hidden_device(12), 2);

        assert_eq!(registry.unregister_hidden_device(11), Some(1));
        assert_eq!(registry.register_hidden_device(13), 1);
        assert_eq!(registry.unregister_hidden_device(10), Some(0));
        assert_eq!(registry.register_hidden_device(14), 0);
        assert_eq!(registry.register_hidden_device(15), 3);

        assert_eq!(registry.unregister_hidden_device(99), None);
        assert_eq!(registry.hidden_count(), 4);
    }

    #[test]
    fn test_redirection_uniqueness() {
        let registry = registry_with(vec![child(1, 0x10, 1)]);
        let id = create_mock_device_id(0x10, 0x0001, 1);

        registry.add_redirection(&id).unwrap();
        assert!(matches!(
            registry.add_redirection(&id),
            Err(FilterError::AlreadyExists(_))
        ));
        assert_eq!(registry.redirection_count(), 1);

        let missing = create_mock_device_id(0x99, 0x0001, 1);
        assert!(matches!(
            registry.add_redirection(&missing),
            Err(FilterError::NotFound(_))
        ));
        assert_eq!(registry.redirection_count(), 1);

        registry.remove_redirection(&id).unwrap();
        assert!(registry.remove_redirection(&id).is_err());
        registry.add_redirection(&id).unwrap();
    }

    #[test]
    fn test_modify_redirection_checks_owner() {
        let registry = registry_with(vec![child(1, 0x10, 1)]);
        let id = create_mock_device_id(0x10, 0x0001, 1);
        let redirection = registry.add_redirection(&id).unwrap();
        redirection.bind_owner(ProcessId(5));

        assert!(registry.modify_redirection(&id, Some(ProcessId(6)), |_| ()).is_err());
        assert!(registry.modify_redirection(&id, Some(ProcessId(5)), |_| ()).is_ok());
        assert!(registry.modify_redirection(&id, Some(ProcessId::ANY), |_| ()).is_ok());

        assert!(registry.should_redirect(&id));
        registry
            .modify_redirection(&id, None, Redirection::notify_removal_started)
            .unwrap();
        assert!(!registry.should_redirect(&id));
    }
}
