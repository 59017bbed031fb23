//! Test utilities for the filter workspace
//!
//! Builders for identities, descriptors and enumeration records shared by
//! the unit and integration tests of every crate.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{create_mock_descriptor, create_mock_device_id};
//!
//! let id = create_mock_device_id(0x1234, 0x5678, 1);
//! assert_eq!(id.device_id, "USB\\VID_1234&PID_5678");
//!
//! let desc = create_mock_descriptor(0x1234, 0x5678);
//! assert_eq!(desc.vendor_id, 0x1234);
//! ```

use protocol::{DeviceDescriptor, DeviceId, DeviceInfo, DeviceSpeed, USB_CLASS_HUB};
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the device ID / instance ID pair the bus reports for a device
pub fn create_mock_device_id(vendor_id: u16, product_id: u16, instance: u32) -> DeviceId {
    DeviceId::new(
        format!("USB\\VID_{:04X}&PID_{:04X}", vendor_id, product_id),
        format!("5&2f6a1b3c&0&{}", instance),
    )
}

/// Location string for a port on a hub
pub fn create_mock_location(port: u16, hub: u16) -> String {
    format!("Port_#{:04X}.Hub_#{:04X}", port, hub)
}

/// Create a device descriptor with one configuration and no device class
pub fn create_mock_descriptor(vendor_id: u16, product_id: u16) -> DeviceDescriptor {
    DeviceDescriptor {
        bcd_usb: 0x0200,
        device_class: 0x00,
        device_subclass: 0x00,
        device_protocol: 0x00,
        max_packet_size0: 64,
        vendor_id,
        product_id,
        bcd_device: 0x0100,
        manufacturer_index: 1,
        product_index: 2,
        serial_number_index: 3,
        num_configurations: 1,
    }
}

/// Create a hub device descriptor
pub fn create_mock_hub_descriptor(vendor_id: u16, product_id: u16) -> DeviceDescriptor {
    DeviceDescriptor {
        device_class: USB_CLASS_HUB,
        ..create_mock_descriptor(vendor_id, product_id)
    }
}

/// Create an enumeration record for a device
pub fn create_mock_device_info(vendor_id: u16, product_id: u16, instance: u32) -> DeviceInfo {
    DeviceInfo {
        id: create_mock_device_id(vendor_id, product_id, instance),
        filter_id: 0,
        port: instance,
        speed: DeviceSpeed::High,
        descriptor: create_mock_descriptor(vendor_id, product_id),
    }
}

/// Build a configuration descriptor with one interface per class code
///
/// Each interface carries a single bulk endpoint so the walk over the
/// descriptor has to step across non-interface entries.
pub fn create_config_descriptor(configuration_value: u8, interface_classes: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    for (number, class) in interface_classes.iter().enumerate() {
        // Interface descriptor
        body.extend_from_slice(&[9, 0x04, number as u8, 0, 1, *class, 0, 0, 0]);
        // Endpoint descriptor
        body.extend_from_slice(&[7, 0x05, 0x81 + number as u8, 0x02, 0x00, 0x02, 0]);
    }

    let total = (9 + body.len()) as u16;
    let mut bytes = vec![
        9,
        0x02,
        (total & 0xff) as u8,
        (total >> 8) as u8,
        interface_classes.len() as u8,
        configuration_value,
        0,
        0x80,
        50,
    ];
    bytes.extend_from_slice(&body);
    bytes
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
