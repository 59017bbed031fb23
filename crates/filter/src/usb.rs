//! Bus probing and hardware control over libusb
//!
//! [`RusbPlatform`] implements the identity-probing and hardware-control
//! collaborators for Linux hosts. A device node is addressed as
//! `bus << 8 | address`. Device-stack attachment is an OS service libusb
//! does not offer, so hosts pair this with their own [`DeviceStack`].
//!
//! [`DeviceStack`]: crate::platform::DeviceStack

use crate::platform::{BusProbe, HardwareControl, NativeHandle, PlatformError, PlatformResult};
use protocol::{DeviceDescriptor, DeviceSpeed};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

const REQUEST_TYPE_DEVICE_TO_HOST: u8 = 0x80;
const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
const DESCRIPTOR_TYPE_CONFIGURATION: u16 = 0x02;
const CONFIG_DESCRIPTOR_HEADER_LEN: usize = 9;

/// Node handle of the device at `bus`/`address`
pub fn node_handle(bus: u8, address: u8) -> NativeHandle {
    NativeHandle(u64::from(bus) << 8 | u64::from(address))
}

/// Inverse of [`node_handle`]; `None` for handles no libusb device can have
pub fn split_node_handle(node: NativeHandle) -> Option<(u8, u8)> {
    if node.0 > 0xFFFF {
        return None;
    }
    Some(((node.0 >> 8) as u8, node.0 as u8))
}

pub fn map_rusb_error(err: rusb::Error) -> PlatformError {
    match err {
        rusb::Error::NoDevice | rusb::Error::NotFound => PlatformError::NoSuchDevice,
        rusb::Error::Busy | rusb::Error::Interrupted => PlatformError::NotReady,
        other => PlatformError::Failed(other.to_string()),
    }
}

/// `None` for speeds the bus could not determine
pub fn map_device_speed(speed: rusb::Speed) -> Option<DeviceSpeed> {
    match speed {
        rusb::Speed::Low => Some(DeviceSpeed::Low),
        rusb::Speed::Full => Some(DeviceSpeed::Full),
        rusb::Speed::High => Some(DeviceSpeed::High),
        rusb::Speed::Super | rusb::Speed::SuperPlus => Some(DeviceSpeed::Super),
        _ => None,
    }
}

/// BCD encoding of a decoded version, e.g. 2.10 -> 0x0210
pub fn version_to_bcd(version: rusb::Version) -> u16 {
    let major = u16::from(version.major());
    (major / 10) << 12
        | (major % 10) << 8
        | u16::from(version.minor() & 0x0F) << 4
        | u16::from(version.sub_minor() & 0x0F)
}

fn convert_descriptor(desc: &rusb::DeviceDescriptor) -> DeviceDescriptor {
    DeviceDescriptor {
        bcd_usb: version_to_bcd(desc.usb_version()),
        device_class: desc.class_code(),
        device_subclass: desc.sub_class_code(),
        device_protocol: desc.protocol_code(),
        max_packet_size0: desc.max_packet_size(),
        vendor_id: desc.vendor_id(),
        product_id: desc.product_id(),
        bcd_device: version_to_bcd(desc.device_version()),
        manufacturer_index: desc.manufacturer_string_index().unwrap_or(0),
        product_index: desc.product_string_index().unwrap_or(0),
        serial_number_index: desc.serial_number_string_index().unwrap_or(0),
        num_configurations: desc.num_configurations(),
    }
}

/// Bus-side collaborator backed by a libusb context
pub struct RusbPlatform {
    context: Context,
    timeout: Duration,
}

impl RusbPlatform {
    pub fn new() -> PlatformResult<Self> {
        let context = Context::new().map_err(map_rusb_error)?;
        Ok(Self {
            context,
            timeout: DEFAULT_CONTROL_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Nodes of every device currently on any bus
    pub fn nodes(&self) -> PlatformResult<Vec<NativeHandle>> {
        let devices = self.context.devices().map_err(map_rusb_error)?;
        Ok(devices
            .iter()
            .map(|device| node_handle(device.bus_number(), device.address()))
            .collect())
    }

    /// Nodes of the devices attached to the hub at `hub`
    pub fn children_of(&self, hub: NativeHandle) -> PlatformResult<Vec<NativeHandle>> {
        let devices = self.context.devices().map_err(map_rusb_error)?;
        Ok(devices
            .iter()
            .filter(|device| {
                device
                    .get_parent()
                    .is_some_and(|parent| node_handle(parent.bus_number(), parent.address()) == hub)
            })
            .map(|device| node_handle(device.bus_number(), device.address()))
            .collect())
    }

    fn device(&self, node: NativeHandle) -> PlatformResult<Device<Context>> {
        let (bus, address) = split_node_handle(node).ok_or(PlatformError::NoSuchDevice)?;
        let devices = self.context.devices().map_err(map_rusb_error)?;
        devices
            .iter()
            .find(|device| device.bus_number() == bus && device.address() == address)
            .ok_or(PlatformError::NoSuchDevice)
    }

    fn open(&self, node: NativeHandle) -> PlatformResult<DeviceHandle<Context>> {
        self.device(node)?.open().map_err(map_rusb_error)
    }

    fn raw_descriptor(&self, node: NativeHandle) -> PlatformResult<rusb::DeviceDescriptor> {
        self.device(node)?.device_descriptor().map_err(map_rusb_error)
    }

    fn read_configuration(
        &self,
        handle: &DeviceHandle<Context>,
        index: u8,
        buf: &mut [u8],
    ) -> PlatformResult<usize> {
        handle
            .read_control(
                REQUEST_TYPE_DEVICE_TO_HOST,
                REQUEST_GET_DESCRIPTOR,
                DESCRIPTOR_TYPE_CONFIGURATION << 8 | u16::from(index),
                0,
                buf,
                self.timeout,
            )
            .map_err(map_rusb_error)
    }
}

impl BusProbe for RusbPlatform {
    fn device_id(&self, node: NativeHandle) -> PlatformResult<String> {
        let desc = self.raw_descriptor(node)?;
        Ok(format!(
            "USB\\VID_{:04X}&PID_{:04X}",
            desc.vendor_id(),
            desc.product_id()
        ))
    }

    /// `<bus>&<port path>`, stable across re-enumeration on the same port
    fn instance_id(&self, node: NativeHandle) -> PlatformResult<String> {
        let device = self.device(node)?;
        let ports = device.port_numbers().map_err(map_rusb_error)?;
        let path = ports
            .iter()
            .map(u8::to_string)
            .collect::<Vec<_>>()
            .join(".");
        Ok(format!("{}&{}", device.bus_number(), path))
    }

    fn location_id(&self, node: NativeHandle) -> PlatformResult<String> {
        let device = self.device(node)?;
        let hub = device
            .get_parent()
            .map_or(0, |parent| parent.address());
        Ok(format!(
            "Port_#{:04}.Hub_#{:04}",
            device.port_number(),
            hub
        ))
    }

    fn port(&self, node: NativeHandle) -> PlatformResult<u32> {
        Ok(u32::from(self.device(node)?.port_number()))
    }

    fn speed(&self, node: NativeHandle) -> PlatformResult<DeviceSpeed> {
        map_device_speed(self.device(node)?.speed()).ok_or(PlatformError::NotReady)
    }

    fn device_descriptor(&self, node: NativeHandle) -> PlatformResult<DeviceDescriptor> {
        Ok(convert_descriptor(&self.raw_descriptor(node)?))
    }

    /// Two GET_DESCRIPTOR requests: the header for `wTotalLength`, then
    /// the whole descriptor
    fn configuration_descriptor(&self, node: NativeHandle, index: u8) -> PlatformResult<Vec<u8>> {
        let handle = self.open(node)?;

        let mut header = [0u8; CONFIG_DESCRIPTOR_HEADER_LEN];
        let read = self.read_configuration(&handle, index, &mut header)?;
        if read < 4 {
            return Err(PlatformError::Failed(format!(
                "short configuration descriptor header ({} bytes)",
                read
            )));
        }

        let total = usize::from(u16::from_le_bytes([header[2], header[3]]));
        let mut full = vec![0u8; total.max(CONFIG_DESCRIPTOR_HEADER_LEN)];
        let read = self.read_configuration(&handle, index, &mut full)?;
        full.truncate(read);
        debug!("Read configuration {} of {}: {} bytes", index, node, read);
        Ok(full)
    }
}

impl HardwareControl for RusbPlatform {
    fn reset(&self, node: NativeHandle) -> PlatformResult<()> {
        let handle = self.open(node)?;
        handle.reset().map_err(map_rusb_error)
    }

    /// libusb has no port power control; a reset that makes the device
    /// re-enumerate is the closest equivalent
    fn cycle(&self, node: NativeHandle) -> PlatformResult<()> {
        let handle = self.open(node)?;
        match handle.reset() {
            Ok(()) => Ok(()),
            // The device re-enumerated under a new address
            Err(rusb::Error::NotFound) => {
                debug!("{} re-enumerated during cycle", node);
                Ok(())
            }
            Err(e) => {
                warn!("Port cycle of {} failed: {}", node, e);
                Err(map_rusb_error(e))
            }
        }
    }

    fn set_configuration(&self, node: NativeHandle, configuration: u8) -> PlatformResult<()> {
        let handle = self.open(node)?;
        handle
            .set_active_configuration(configuration)
            .map_err(map_rusb_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_handle() {
        let node = node_handle(3, 17);
        assert_eq!(node, NativeHandle(0x0311));
        assert_eq!(split_node_handle(node), Some((3, 17)));
        assert_eq!(split_node_handle(NativeHandle(0x1_0000)), None);
    }

    #[test]
    fn test_map_device_speed() {
        assert_eq!(map_device_speed(rusb::Speed::Low), Some(DeviceSpeed::Low));
        assert_eq!(map_device_speed(rusb::Speed::High), Some(DeviceSpeed::High));
        assert_eq!(map_device_speed(rusb::Speed::SuperPlus), Some(DeviceSpeed::Super));
        assert_eq!(map_device_speed(rusb::Speed::Unknown), None);
    }

    #[test]
    fn test_version_to_bcd() {
        assert_eq!(version_to_bcd(rusb::Version(2, 1, 0)), 0x0210);
        assert_eq!(version_to_bcd(rusb::Version(1, 0, 0)), 0x0100);
        assert_eq!(version_to_bcd(rusb::Version(12, 3, 4)), 0x1234);
        assert_eq!(version_to_bcd(rusb::Version::from_bcd(0x0320)), 0x0320);
    }

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::NoDevice), PlatformError::NoSuchDevice);
        assert_eq!(map_rusb_error(rusb::Error::NotFound), PlatformError::NoSuchDevice);
        assert_eq!(map_rusb_error(rusb::Error::Busy), PlatformError::NotReady);
        assert!(matches!(
            map_rusb_error(rusb::Error::Pipe),
            PlatformError::Failed(_)
        ));
    }
}
