//! Kernel request structures
//!
//! Fixed-layout structures exchanged with the usbfs character device. Field
//! order and widths follow `<linux/usbdevice_fs.h>`; `repr(C)` inserts the same
//! padding the kernel expects (on 64-bit targets the word between the last
//! integer field and the data pointer of `CtrlTransfer` and `BulkTransfer`).

use std::ffi::{c_int, c_uint, c_void};
use std::fmt;

/// URB types understood by `USBDEVFS_SUBMITURB`
pub const URB_TYPE_ISO: u8 = 0;
pub const URB_TYPE_INTERRUPT: u8 = 1;
pub const URB_TYPE_CONTROL: u8 = 2;
pub const URB_TYPE_BULK: u8 = 3;

/// Correlation key for an asynchronous request
///
/// Allocated by the submitting side from a monotonically increasing counter
/// and stored in the URB's `usercontext` field, so a reaped URB can be matched
/// back to its transfer without relying on the URB's address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl RequestId {
    /// Encode the id into a `usercontext` value
    pub fn as_user_context(self) -> *mut c_void {
        self.0 as usize as *mut c_void
    }

    /// Decode the id from a `usercontext` value written by `as_user_context`
    pub fn from_user_context(ctx: *mut c_void) -> Self {
        RequestId(ctx as usize as u64)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// `struct usbdevfs_ctrltransfer`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CtrlTransfer {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
    /// Timeout in milliseconds, enforced by the kernel
    pub timeout: u32,
    pub data: *mut c_void,
}

impl CtrlTransfer {
    pub fn new(
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
        timeout: u32,
        data: *mut c_void,
    ) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
            length,
            timeout,
            data,
        }
    }

    /// Device-to-host when bit 7 of bmRequestType is set
    pub fn is_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }
}

/// `struct usbdevfs_bulktransfer`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BulkTransfer {
    /// Endpoint address, including the direction bit
    pub endpoint: c_uint,
    pub length: c_uint,
    /// Timeout in milliseconds, enforced by the kernel
    pub timeout: c_uint,
    pub data: *mut c_void,
}

impl BulkTransfer {
    pub fn new(endpoint: u8, length: u32, timeout: u32, data: *mut c_void) -> Self {
        Self {
            endpoint: endpoint as c_uint,
            length,
            timeout,
            data,
        }
    }

    pub fn is_in(&self) -> bool {
        self.endpoint & 0x80 != 0
    }
}

/// `struct usbdevfs_setinterface`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetInterface {
    pub interface: c_uint,
    pub alt_setting: c_uint,
}

/// `struct usbdevfs_ioctl`, used to forward a driver-control command
/// (for example `DISCONNECT`) to the driver bound to an interface
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct UsbIoctl {
    pub interface: c_int,
    pub command: c_int,
    pub data: *mut c_void,
}

impl UsbIoctl {
    pub fn new(interface: u8, command: u32) -> Self {
        Self {
            interface: interface as c_int,
            command: command as c_int,
            data: std::ptr::null_mut(),
        }
    }
}

/// `struct usbdevfs_urb` without the trailing isochronous packet array
///
/// A submitted URB is read and written by the kernel until it is reaped, so
/// it must stay at a fixed address and outlive the request.
#[repr(C)]
#[derive(Debug)]
pub struct Urb {
    pub urb_type: u8,
    pub endpoint: u8,
    pub status: c_int,
    pub flags: c_uint,
    pub buffer: *mut c_void,
    pub buffer_length: c_int,
    pub actual_length: c_int,
    pub start_frame: c_int,
    /// `number_of_packets` for isochronous URBs, `stream_id` for bulk streams
    pub number_of_packets: c_uint,
    pub error_count: c_int,
    pub signr: c_uint,
    pub usercontext: *mut c_void,
}

impl Urb {
    /// Build a bulk URB tagged with `id`
    pub fn bulk(endpoint: u8, buffer: *mut u8, buffer_length: c_int, id: RequestId) -> Self {
        Self {
            urb_type: URB_TYPE_BULK,
            endpoint,
            status: 0,
            flags: 0,
            buffer: buffer.cast(),
            buffer_length,
            actual_length: 0,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            signr: 0,
            usercontext: id.as_user_context(),
        }
    }

    /// Correlation key stored at submission time
    pub fn request_id(&self) -> RequestId {
        RequestId::from_user_context(self.usercontext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_user_context() {
        let id = RequestId(0x1234_5678);
        let ctx = id.as_user_context();
        assert_eq!(RequestId::from_user_context(ctx), id);
    }

    #[test]
    fn test_bulk_urb_fields() {
        let mut buf = [0u8; 64];
        let urb = Urb::bulk(0x81, buf.as_mut_ptr(), 64, RequestId(7));
        assert_eq!(urb.urb_type, URB_TYPE_BULK);
        assert_eq!(urb.endpoint, 0x81);
        assert_eq!(urb.buffer_length, 64);
        assert_eq!(urb.status, 0);
        assert_eq!(urb.request_id(), RequestId(7));
    }

    #[test]
    fn test_direction_bits() {
        let ctrl = CtrlTransfer::new(0x80, 6, 0x0100, 0, 18, 1000, std::ptr::null_mut());
        assert!(ctrl.is_in());
        let ctrl = CtrlTransfer::new(0x40, 1, 0, 0, 0, 1000, std::ptr::null_mut());
        assert!(!ctrl.is_in());

        assert!(BulkTransfer::new(0x81, 64, 1000, std::ptr::null_mut()).is_in());
        assert!(!BulkTransfer::new(0x01, 64, 1000, std::ptr::null_mut()).is_in());
    }

    #[test]
    fn test_request_id_display() {
        assert_eq!(RequestId(42).to_string(), "#42");
    }
}
