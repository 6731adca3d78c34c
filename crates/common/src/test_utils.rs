//! Test utilities for usbfs-engine
//!
//! Helper constructors and timeout guards shared by the crates' tests.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_device_info;
//!
//! let device = create_mock_device_info(4, 0x1234, 0x5678);
//! assert_eq!(device.vendor_id, 0x1234);
//! assert_eq!(device.devpath.to_str(), Some("/dev/bus/usb/001/004"));
//! ```

use crate::discovery::{DeviceInfo, DeviceSpeed, usbfs_path};
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a mock DeviceInfo on bus 1 at address `address`
pub fn create_mock_device_info(address: u8, vendor_id: u16, product_id: u16) -> DeviceInfo {
    DeviceInfo {
        vendor_id,
        product_id,
        bus_number: 1,
        device_address: address,
        class: 0x00,
        speed: DeviceSpeed::High,
        devpath: usbfs_path(1, address),
    }
}

/// Create `count` devices with distinct addresses and VID:PID pairs
pub fn create_mock_device_list(count: u8) -> Vec<DeviceInfo> {
    (1..=count)
        .map(|i| create_mock_device_info(i, 0x1000 + i as u16, 0x2000 + i as u16))
        .collect()
}

/// Run a future with a timeout
///
/// Returns an error if the future doesn't complete within the duration.
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

#[derive(Debug)]
pub struct TimeoutError {
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

/// An 18-byte device descriptor for VID 0x1234 / PID 0x5678
pub fn create_mock_device_descriptor() -> Vec<u8> {
    vec![
        0x12, // bLength
        0x01, // bDescriptorType (Device)
        0x00, 0x02, // bcdUSB (2.00)
        0x00, // bDeviceClass
        0x00, // bDeviceSubClass
        0x00, // bDeviceProtocol
        0x40, // bMaxPacketSize0 (64 bytes)
        0x34, 0x12, // idVendor (0x1234)
        0x78, 0x56, // idProduct (0x5678)
        0x00, 0x01, // bcdDevice (1.00)
        0x01, // iManufacturer
        0x02, // iProduct
        0x03, // iSerialNumber
        0x01, // bNumConfigurations
    ]
}

/// Payload whose bytes all equal `tag`, so transfers can be told apart
pub fn create_tagged_payload(tag: u8, size: usize) -> Vec<u8> {
    vec![tag; size]
}

/// Incrementing byte pattern, wrapping at 256
pub fn create_mock_bulk_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i & 0xFF) as u8).collect()
}
