//! Scripted host for driving the filter core in integration tests
//!
//! `MockHost` plays both the bus and the OS: it hands out node handles,
//! answers identity probes, and when the core resets or attaches to a
//! device it re-enumerates the device and calls back into the control
//! device the way a PnP manager would.

#![allow(dead_code)]

use common::test_utils::{create_config_descriptor, create_mock_descriptor, create_mock_location};
use filter::rules::driver::{DRIVER_VALUE, LOCATION_VALUE};
use filter::{
    BusProbe, ControlDevice, DeviceStack, DriverConfig, HardwareControl, MemoryStore, NativeHandle,
    PlatformError, PlatformResult, RegValue,
};
use parking_lot::Mutex;
use protocol::{DeviceDescriptor, DeviceId, DeviceSpeed, ProcessId, RedirectorHandle};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, OnceLock, Weak};

pub const ENUM_ROOT: &str = "Enum\\USB";
pub const HIDE_RULES_KEY: &str = "Parameters\\HideRules";

/// Identity of a simulated device
#[derive(Debug, Clone)]
pub struct MockDevice {
    pub device_id: String,
    pub instance_id: String,
    pub location_id: String,
    pub port: u32,
    pub descriptor: DeviceDescriptor,
    pub configs: Vec<Vec<u8>>,
}

impl MockDevice {
    /// Plain vendor-class device on `port` of hub 1
    pub fn new(vid: u16, pid: u16, port: u16) -> Self {
        Self {
            device_id: format!("USB\\VID_{:04X}&PID_{:04X}", vid, pid),
            instance_id: format!("5&2f6a1b3c&0&{}", port),
            location_id: create_mock_location(port, 1),
            port: u32::from(port),
            descriptor: create_mock_descriptor(vid, pid),
            configs: vec![create_config_descriptor(1, &[0xFF])],
        }
    }

    pub fn id(&self) -> DeviceId {
        DeviceId::new(self.device_id.clone(), self.instance_id.clone())
    }
}

#[derive(Default)]
struct Bus {
    devices: HashMap<NativeHandle, MockDevice>,
    /// Child nodes per hub node, in plug order
    relations: HashMap<NativeHandle, Vec<NativeHandle>>,
}

pub struct MockHost {
    control: OnceLock<Weak<ControlDevice>>,
    bus: Mutex<Bus>,
    next_node: AtomicU64,
    /// Re-enumerate a device when its port is cycled
    pub reenumerate_on_cycle: AtomicBool,
    /// Answer attach requests by adding our filter to the stack
    pub auto_attach: AtomicBool,
    pub fail_cycle: AtomicBool,
    /// Refuse this many handle opens before succeeding
    pub refuse_opens: AtomicUsize,
    /// Device ID queries still to be held at `rendezvous`
    held_queries: AtomicUsize,
    rendezvous: Mutex<Option<Arc<Barrier>>>,
    pub cycles: Mutex<Vec<NativeHandle>>,
    pub resets: Mutex<Vec<NativeHandle>>,
    pub set_configurations: Mutex<Vec<(NativeHandle, u8)>>,
    pub attaches: Mutex<Vec<NativeHandle>>,
    pub opens: Mutex<Vec<(NativeHandle, ProcessId)>>,
}

impl MockHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            control: OnceLock::new(),
            bus: Mutex::new(Bus::default()),
            next_node: AtomicU64::new(0x100),
            reenumerate_on_cycle: AtomicBool::new(true),
            auto_attach: AtomicBool::new(true),
            fail_cycle: AtomicBool::new(false),
            refuse_opens: AtomicUsize::new(0),
            held_queries: AtomicUsize::new(0),
            rendezvous: Mutex::new(None),
            cycles: Mutex::new(Vec::new()),
            resets: Mutex::new(Vec::new()),
            set_configurations: Mutex::new(Vec::new()),
            attaches: Mutex::new(Vec::new()),
            opens: Mutex::new(Vec::new()),
        })
    }

    pub fn bind(&self, control: &Arc<ControlDevice>) {
        let _ = self.control.set(Arc::downgrade(control));
    }

    fn control(&self) -> Option<Arc<ControlDevice>> {
        self.control.get().and_then(Weak::upgrade)
    }

    fn allocate_node(&self) -> NativeHandle {
        NativeHandle(self.next_node.fetch_add(1, Ordering::Relaxed))
    }

    /// Add a root hub and let the core filter it
    pub fn add_root_hub(&self) -> NativeHandle {
        let node = self.allocate_node();
        {
            let mut bus = self.bus.lock();
            bus.devices.insert(
                node,
                MockDevice {
                    device_id: "USB\\ROOT_HUB30".into(),
                    instance_id: "4&1b2c3d4e&0".into(),
                    location_id: String::new(),
                    port: 0,
                    descriptor: common::test_utils::create_mock_hub_descriptor(0x1d6b, 0x0003),
                    configs: Vec::new(),
                },
            );
            bus.relations.insert(node, Vec::new());
        }
        if let Some(control) = self.control() {
            control.add_device(node);
        }
        node
    }

    /// Plug `device` into `hub` and report the new bus relations
    pub fn plug(&self, hub: NativeHandle, device: MockDevice) -> NativeHandle {
        let node = self.allocate_node();
        let relations = {
            let mut bus = self.bus.lock();
            bus.devices.insert(node, device);
            let relations = bus.relations.entry(hub).or_default();
            relations.push(node);
            relations.clone()
        };
        if let Some(control) = self.control() {
            control.bus_relations_changed(hub, &relations);
        }
        node
    }

    /// Unplug `node` from `hub`: new relations first, then the removal
    pub fn unplug(&self, hub: NativeHandle, node: NativeHandle) -> Option<MockDevice> {
        let (device, relations) = {
            let mut bus = self.bus.lock();
            let device = bus.devices.remove(&node)?;
            let relations = bus.relations.entry(hub).or_default();
            relations.retain(|n| *n != node);
            (device, relations.clone())
        };
        if let Some(control) = self.control() {
            control.bus_relations_changed(hub, &relations);
            control.remove_device(node);
        }
        Some(device)
    }

    fn hub_of(&self, node: NativeHandle) -> Option<NativeHandle> {
        self.bus
            .lock()
            .relations
            .iter()
            .find(|(_, children)| children.contains(&node))
            .map(|(hub, _)| *hub)
    }

    /// Current node of the device with this identity
    pub fn node_of(&self, id: &DeviceId) -> Option<NativeHandle> {
        self.bus
            .lock()
            .devices
            .iter()
            .find(|(_, device)| device.id() == *id)
            .map(|(node, _)| *node)
    }

    /// Hold the next `count` device ID queries until all of them arrived
    pub fn hold_device_id_queries(&self, count: usize) {
        *self.rendezvous.lock() = Some(Arc::new(Barrier::new(count)));
        self.held_queries.store(count, Ordering::SeqCst);
    }

    pub fn cycle_count(&self) -> usize {
        self.cycles.lock().len()
    }

    fn device<T>(&self, node: NativeHandle, f: impl FnOnce(&MockDevice) -> T) -> PlatformResult<T> {
        self.bus
            .lock()
            .devices
            .get(&node)
            .map(f)
            .ok_or(PlatformError::NoSuchDevice)
    }
}

impl BusProbe for MockHost {
    fn device_id(&self, node: NativeHandle) -> PlatformResult<String> {
        let held = self
            .held_queries
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if held {
            let barrier = self.rendezvous.lock().clone();
            if let Some(barrier) = barrier {
                barrier.wait();
            }
        }
        self.device(node, |d| d.device_id.clone())
    }

    fn instance_id(&self, node: NativeHandle) -> PlatformResult<String> {
        self.device(node, |d| d.instance_id.clone())
    }

    fn location_id(&self, node: NativeHandle) -> PlatformResult<String> {
        self.device(node, |d| d.location_id.clone())
    }

    fn port(&self, node: NativeHandle) -> PlatformResult<u32> {
        self.device(node, |d| d.port)
    }

    fn speed(&self, _node: NativeHandle) -> PlatformResult<DeviceSpeed> {
        Ok(DeviceSpeed::High)
    }

    fn device_descriptor(&self, node: NativeHandle) -> PlatformResult<DeviceDescriptor> {
        self.device(node, |d| d.descriptor)
    }

    fn configuration_descriptor(&self, node: NativeHandle, index: u8) -> PlatformResult<Vec<u8>> {
        self.device(node, |d| d.configs.get(usize::from(index)).cloned())?
            .ok_or_else(|| PlatformError::Failed(format!("no configuration {}", index)))
    }
}

impl HardwareControl for MockHost {
    fn reset(&self, node: NativeHandle) -> PlatformResult<()> {
        self.resets.lock().push(node);
        Ok(())
    }

    /// Drops the device off its hub and brings it back under a new node
    fn cycle(&self, node: NativeHandle) -> PlatformResult<()> {
        self.cycles.lock().push(node);
        if self.fail_cycle.load(Ordering::SeqCst) {
            return Err(PlatformError::Failed("port cycle refused".into()));
        }
        if !self.reenumerate_on_cycle.load(Ordering::SeqCst) {
            return Ok(());
        }

        let hub = self.hub_of(node).ok_or(PlatformError::NoSuchDevice)?;
        let device = self.unplug(hub, node).ok_or(PlatformError::NoSuchDevice)?;
        self.plug(hub, device);
        Ok(())
    }

    fn set_configuration(&self, node: NativeHandle, configuration: u8) -> PlatformResult<()> {
        self.set_configurations.lock().push((node, configuration));
        Ok(())
    }
}

impl DeviceStack for MockHost {
    fn attach_to_device_stack(&self, node: NativeHandle) -> PlatformResult<()> {
        self.attaches.lock().push(node);
        if self.auto_attach.load(Ordering::SeqCst) {
            if let Some(control) = self.control() {
                control.add_device(node);
            }
        }
        Ok(())
    }

    fn open_user_handle(
        &self,
        node: NativeHandle,
        requestor: ProcessId,
    ) -> PlatformResult<RedirectorHandle> {
        let refused = self
            .refuse_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(PlatformError::NotReady);
        }
        self.opens.lock().push((node, requestor));
        Ok(RedirectorHandle(0xF000 | node.0))
    }
}

/// Record that `device` has a function driver installed
pub fn install_driver(store: &MemoryStore, device: &MockDevice) {
    let key = enum_key(device);
    store.set_value(&key, LOCATION_VALUE, RegValue::String(device.location_id.clone()));
    store.set_value(&key, DRIVER_VALUE, RegValue::String("{36fc9e60}\\0001".into()));
}

/// Record that `device` was seen on its port but never got a driver
pub fn record_driverless(store: &MemoryStore, device: &MockDevice) -> String {
    let key = enum_key(device);
    store.set_value(&key, LOCATION_VALUE, RegValue::String(device.location_id.clone()));
    key
}

pub fn enum_key(device: &MockDevice) -> String {
    let vid_pid = device.device_id.trim_start_matches("USB\\");
    format!("{}\\{}\\{}", ENUM_ROOT, vid_pid, device.instance_id)
}

pub fn test_config() -> DriverConfig {
    let mut config = DriverConfig::default();
    config.storage.hide_rules_key = HIDE_RULES_KEY.into();
    config.storage.enum_root = ENUM_ROOT.into();
    config
}

pub struct Harness {
    pub host: Arc<MockHost>,
    pub store: Arc<MemoryStore>,
    pub control: Arc<ControlDevice>,
    pub hub: NativeHandle,
}

/// Start a control device over a fresh host with one root hub
pub fn start(store: MemoryStore) -> Harness {
    common::init_test_logging();
    let host = MockHost::new();
    let store = Arc::new(store);
    let control = ControlDevice::start(&test_config(), host.clone(), store.clone());
    host.bind(&control);
    let hub = host.add_root_hub();
    Harness {
        host,
        store,
        control,
        hub,
    }
}
