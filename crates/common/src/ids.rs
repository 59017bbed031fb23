//! Helpers for bus identity strings
//!
//! Device IDs (`USB\VID_1234&PID_5678`), location strings
//! (`Port_#0001.Hub_#0004`) and enumeration key names carry fixed-width hex
//! fields at known offsets. These helpers extract them.

use crate::{Error, Result};

/// Case-sensitive match where `?` in `pattern` matches any single character
///
/// Lengths must be equal; a single trailing NUL in `value` is ignored.
pub fn wildcard_match(pattern: &str, value: &str) -> bool {
    let value = value.strip_suffix('\0').unwrap_or(value);
    let (p, v) = (pattern.as_bytes(), value.as_bytes());
    p.len() == v.len() && p.iter().zip(v).all(|(p, v)| *p == b'?' || p == v)
}

/// Parse four hex digits starting at character offset `offset`
pub fn four_hex(value: &str, offset: usize) -> Result<u16> {
    let field = value
        .get(offset..offset + 4)
        .ok_or_else(|| Error::Parse(format!("'{}' too short for hex field at {}", value, offset)))?;
    u16::from_str_radix(field, 16)
        .map_err(|_| Error::Parse(format!("'{}' is not a hex field in '{}'", field, value)))
}

/// Combine two four-digit hex fields into `high << 16 | low`
pub fn eight_hex(value: &str, high_offset: usize, low_offset: usize) -> Result<u32> {
    let high = four_hex(value, high_offset)?;
    let low = four_hex(value, low_offset)?;
    Ok((u32::from(high) << 16) | u32::from(low))
}

/// `0xVVVVPPPP` from a device ID of the form `USB\VID_XXXX&PID_XXXX`
pub fn vid_pid_from_device_id(device_id: &str) -> Result<u32> {
    eight_hex(device_id, 8, 17)
}

/// `0xVVVVPPPP` from an enumeration key name of the form `VID_XXXX&PID_XXXX`
pub fn vid_pid_from_key_name(name: &str) -> Result<u32> {
    eight_hex(name, 4, 13)
}

/// `0xPPPPHHHH` from a location string of the form `Port_#XXXX.Hub_#XXXX`
pub fn port_hub_from_location(location: &str) -> Result<u32> {
    eight_hex(location, 6, 16)
}

/// True when `device_id` starts with the `USB\` bus prefix
pub fn is_usb_device_id(device_id: &str) -> bool {
    device_id
        .get(..4)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("USB\\"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("VID_????&PID_????", "VID_1234&PID_ABCD"));
        assert!(wildcard_match("Port_#????.Hub_#????", "Port_#0001.Hub_#0004\0"));
        assert!(!wildcard_match("VID_????&PID_????", "VID_1234&PID_ABCD&MI_00"));
        assert!(!wildcard_match("VID_????", "PID_1234"));
    }

    #[test]
    fn test_device_id_fields() {
        assert_eq!(
            vid_pid_from_device_id("USB\\VID_1234&PID_5678").unwrap(),
            0x1234_5678
        );
        assert!(vid_pid_from_device_id("USB\\ROOT_HUB30").is_err());
        assert!(vid_pid_from_device_id("USB\\VID_12").is_err());
    }

    #[test]
    fn test_key_and_location_fields() {
        assert_eq!(vid_pid_from_key_name("VID_046D&PID_C52B").unwrap(), 0x046D_C52B);
        assert_eq!(
            port_hub_from_location("Port_#0003.Hub_#0002").unwrap(),
            0x0003_0002
        );
    }

    #[test]
    fn test_usb_prefix() {
        assert!(is_usb_device_id("USB\\VID_0001&PID_0002"));
        assert!(is_usb_device_id("usb\\vid_0001&pid_0002"));
        assert!(!is_usb_device_id("HID\\VID_0001&PID_0002"));
        assert!(!is_usb_device_id("US"));
    }
}
