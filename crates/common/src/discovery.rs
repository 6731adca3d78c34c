//! USB device discovery
//!
//! Walks the bus with rusb and reports each device together with the usbfs
//! node that the engine opens. Descriptors are only read for the vendor,
//! product and class fields; nothing else is decoded.

use crate::{Error, Result};
use rusb::UsbContext;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Root of the usbfs device nodes
pub const USBFS_ROOT: &str = "/dev/bus/usb";

/// One device found on the bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Bus number
    pub bus_number: u8,
    /// Device address on the bus
    pub device_address: u8,
    /// USB device class
    pub class: u8,
    /// Negotiated speed
    pub speed: DeviceSpeed,
    /// usbfs character device for this device
    pub devpath: PathBuf,
}

impl DeviceInfo {
    pub fn matches_vid_pid(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }

    pub fn matches_bus_dev(&self, bus_number: u8, device_address: u8) -> bool {
        self.bus_number == bus_number && self.device_address == device_address
    }
}

/// USB device speed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceSpeed {
    Unknown,
    /// 1.5 Mbps (USB 1.0)
    Low,
    /// 12 Mbps (USB 1.1)
    Full,
    /// 480 Mbps (USB 2.0)
    High,
    /// 5 Gbps (USB 3.0)
    Super,
    /// 10 Gbps (USB 3.1)
    SuperPlus,
}

/// Path of the usbfs node for a bus/address pair
pub fn usbfs_path(bus_number: u8, device_address: u8) -> PathBuf {
    PathBuf::from(format!(
        "{}/{:03}/{:03}",
        USBFS_ROOT, bus_number, device_address
    ))
}

/// Enumerate all devices currently on the bus
///
/// Devices whose descriptor cannot be read are skipped with a warning.
pub fn list_devices() -> Result<Vec<DeviceInfo>> {
    let context = rusb::Context::new()?;
    let mut found = Vec::new();

    for device in context.devices()?.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(d) => d,
            Err(e) => {
                warn!(
                    "Skipping device {:03}/{:03}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                );
                continue;
            }
        };

        found.push(DeviceInfo {
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            bus_number: device.bus_number(),
            device_address: device.address(),
            class: descriptor.class_code(),
            speed: map_device_speed(device.speed()),
            devpath: usbfs_path(device.bus_number(), device.address()),
        });
    }

    debug!("Enumerated {} USB devices", found.len());
    Ok(found)
}

/// First device in `devices` with the given VID:PID
pub fn select_vid_pid(devices: &[DeviceInfo], vendor_id: u16, product_id: u16) -> Result<&DeviceInfo> {
    devices
        .iter()
        .find(|d| d.matches_vid_pid(vendor_id, product_id))
        .ok_or_else(|| Error::NotFound(format!("{:04x}:{:04x}", vendor_id, product_id)))
}

/// Device in `devices` at the given bus/address
pub fn select_bus_dev(devices: &[DeviceInfo], bus_number: u8, device_address: u8) -> Result<&DeviceInfo> {
    devices
        .iter()
        .find(|d| d.matches_bus_dev(bus_number, device_address))
        .ok_or_else(|| Error::NotFound(format!("bus {} device {}", bus_number, device_address)))
}

/// Find a device on the live bus by VID:PID
pub fn find_by_vid_pid(vendor_id: u16, product_id: u16) -> Result<DeviceInfo> {
    let devices = list_devices()?;
    select_vid_pid(&devices, vendor_id, product_id).cloned()
}

/// Find a device on the live bus by bus number and address
pub fn find_by_bus_dev(bus_number: u8, device_address: u8) -> Result<DeviceInfo> {
    let devices = list_devices()?;
    select_bus_dev(&devices, bus_number, device_address).cloned()
}

/// Parse a `0xVVVV:0xPPPP` pair
///
/// The `0x` prefix is optional; both halves are hexadecimal.
pub fn parse_vid_pid(s: &str) -> Result<(u16, u16)> {
    let (vid, pid) = s
        .split_once(':')
        .ok_or_else(|| Error::Config(format!("Invalid VID:PID '{}', expected VVVV:PPPP", s)))?;

    Ok((parse_hex_id(vid, "VID")?, parse_hex_id(pid, "PID")?))
}

fn parse_hex_id(id: &str, name: &str) -> Result<u16> {
    let hex = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .unwrap_or(id);

    if hex.is_empty() || hex.len() > 4 {
        return Err(Error::Config(format!(
            "Invalid {} '{}', hex part must be 1-4 digits",
            name, id
        )));
    }

    u16::from_str_radix(hex, 16)
        .map_err(|_| Error::Config(format!("Invalid {} '{}', not a valid hex number", name, id)))
}

fn map_device_speed(speed: rusb::Speed) -> DeviceSpeed {
    match speed {
        rusb::Speed::Low => DeviceSpeed::Low,
        rusb::Speed::Full => DeviceSpeed::Full,
        rusb::Speed::High => DeviceSpeed::High,
        rusb::Speed::Super => DeviceSpeed::Super,
        rusb::Speed::SuperPlus => DeviceSpeed::SuperPlus,
        _ => DeviceSpeed::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_mock_device_info, create_mock_device_list};

    #[test]
    fn test_usbfs_path_is_zero_padded() {
        assert_eq!(usbfs_path(1, 4), PathBuf::from("/dev/bus/usb/001/004"));
        assert_eq!(usbfs_path(12, 127), PathBuf::from("/dev/bus/usb/012/127"));
    }

    #[test]
    fn test_map_device_speed() {
        assert_eq!(map_device_speed(rusb::Speed::Low), DeviceSpeed::Low);
        assert_eq!(map_device_speed(rusb::Speed::High), DeviceSpeed::High);
        assert_eq!(
            map_device_speed(rusb::Speed::SuperPlus),
            DeviceSpeed::SuperPlus
        );
        assert_eq!(map_device_speed(rusb::Speed::Unknown), DeviceSpeed::Unknown);
    }

    #[test]
    fn test_parse_vid_pid() {
        assert_eq!(parse_vid_pid("0x1234:0x5678").unwrap(), (0x1234, 0x5678));
        assert_eq!(parse_vid_pid("04f9:00ab").unwrap(), (0x04f9, 0x00ab));
        assert_eq!(parse_vid_pid("0XABCD:0xef01").unwrap(), (0xabcd, 0xef01));
    }

    #[test]
    fn test_parse_vid_pid_invalid() {
        assert!(parse_vid_pid("0x1234").is_err());
        assert!(parse_vid_pid("0xGHIJ:0x5678").is_err());
        assert!(parse_vid_pid("0x12345:0x5678").is_err());
        assert!(parse_vid_pid("0x:0x5678").is_err());
        assert!(parse_vid_pid("0x1234:*").is_err());
    }

    #[test]
    fn test_select_vid_pid() {
        let devices = create_mock_device_list(3);
        let found = select_vid_pid(&devices, 0x1002, 0x2002).unwrap();
        assert_eq!(found.device_address, 2);

        let err = select_vid_pid(&devices, 0xdead, 0xbeef).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_select_bus_dev() {
        let devices = vec![
            create_mock_device_info(1, 0x1234, 0x5678),
            create_mock_device_info(9, 0x1234, 0x5678),
        ];
        let found = select_bus_dev(&devices, 1, 9).unwrap();
        assert_eq!(found.devpath, PathBuf::from("/dev/bus/usb/001/009"));
        assert!(select_bus_dev(&devices, 2, 9).is_err());
    }

    #[test]
    fn test_device_info_serializes() {
        let device = create_mock_device_info(5, 0x1234, 0x5678);
        let json = serde_json::to_string(&device).unwrap();
        assert!(json.contains("\"vendor_id\":4660"));
        assert!(json.contains("/dev/bus/usb/001/005"));
    }
}
