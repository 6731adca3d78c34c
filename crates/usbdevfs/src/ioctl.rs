//! usbfs ioctl command codes and raw entry points
//!
//! Codes are built with nix's `request_code_*` macros from the same
//! direction/type/number/size tuples as `<linux/usbdevice_fs.h>`. The entry
//! points are thin `unsafe` wrappers: callers must pass a descriptor for an
//! open usbfs device and pointers that stay valid for the duration the kernel
//! uses them (for `submit_urb`, until the URB is reaped).

use crate::types::{BulkTransfer, CtrlTransfer, SetInterface, Urb, UsbIoctl};
use nix::{
    ioctl_none_bad, ioctl_read_bad, ioctl_readwrite_bad, ioctl_write_ptr_bad, request_code_none,
    request_code_read, request_code_readwrite, request_code_write,
};
use std::ffi::c_uint;
use std::mem::size_of;

/// Numeric command codes, truncated to the 32 bits the kernel compares
pub mod codes {
    use super::*;

    pub const CONTROL: u32 = request_code_readwrite!(b'U', 0, size_of::<CtrlTransfer>()) as u32;
    pub const BULK: u32 = request_code_readwrite!(b'U', 2, size_of::<BulkTransfer>()) as u32;
    pub const SETINTERFACE: u32 = request_code_read!(b'U', 4, size_of::<SetInterface>()) as u32;
    pub const SETCONFIGURATION: u32 = request_code_read!(b'U', 5, size_of::<c_uint>()) as u32;
    pub const SUBMITURB: u32 = request_code_read!(b'U', 10, size_of::<Urb>()) as u32;
    pub const DISCARDURB: u32 = request_code_none!(b'U', 11) as u32;
    pub const REAPURB: u32 = request_code_write!(b'U', 12, size_of::<*mut Urb>()) as u32;
    pub const REAPURBNDELAY: u32 = request_code_write!(b'U', 13, size_of::<*mut Urb>()) as u32;
    pub const CLAIMINTERFACE: u32 = request_code_read!(b'U', 15, size_of::<c_uint>()) as u32;
    pub const RELEASEINTERFACE: u32 = request_code_read!(b'U', 16, size_of::<c_uint>()) as u32;
    pub const IOCTL: u32 = request_code_readwrite!(b'U', 18, size_of::<UsbIoctl>()) as u32;
    pub const RESET: u32 = request_code_none!(b'U', 20) as u32;
    pub const CLEAR_HALT: u32 = request_code_read!(b'U', 21, size_of::<c_uint>()) as u32;
    /// Driver-control command carried inside `UsbIoctl`
    pub const DISCONNECT: u32 = request_code_none!(b'U', 22) as u32;
    /// Driver-control command carried inside `UsbIoctl`
    pub const CONNECT: u32 = request_code_none!(b'U', 23) as u32;
}

ioctl_readwrite_bad!(
    /// Synchronous control transfer; returns the number of bytes transferred
    control,
    codes::CONTROL,
    CtrlTransfer
);
ioctl_readwrite_bad!(
    /// Synchronous bulk transfer; returns the number of bytes transferred
    bulk,
    codes::BULK,
    BulkTransfer
);
ioctl_read_bad!(set_interface, codes::SETINTERFACE, SetInterface);
ioctl_read_bad!(set_configuration, codes::SETCONFIGURATION, c_uint);
ioctl_read_bad!(
    /// Queue an asynchronous URB
    submit_urb,
    codes::SUBMITURB,
    Urb
);
ioctl_write_ptr_bad!(discard_urb, codes::DISCARDURB, Urb);
ioctl_read_bad!(
    /// Block until a URB completes and store its address in `data`
    reap_urb,
    codes::REAPURB,
    *mut Urb
);
ioctl_read_bad!(
    /// Like `reap_urb`, failing with `EAGAIN` when nothing has completed
    reap_urb_ndelay,
    codes::REAPURBNDELAY,
    *mut Urb
);
ioctl_read_bad!(claim_interface, codes::CLAIMINTERFACE, c_uint);
ioctl_read_bad!(release_interface, codes::RELEASEINTERFACE, c_uint);
ioctl_readwrite_bad!(driver_ioctl, codes::IOCTL, UsbIoctl);
ioctl_none_bad!(reset, codes::RESET);
ioctl_read_bad!(clear_halt, codes::CLEAR_HALT, c_uint);

#[cfg(test)]
mod tests {
    use super::codes;

    #[test]
    fn test_command_numbers() {
        // Low byte is the command number, second byte the 'U' type
        assert_eq!(codes::CONTROL & 0xffff, 0x5500);
        assert_eq!(codes::BULK & 0xffff, 0x5502);
        assert_eq!(codes::SUBMITURB & 0xffff, 0x550a);
        assert_eq!(codes::REAPURBNDELAY & 0xffff, 0x550d);
        assert_eq!(codes::DISCONNECT, 0x5516);
        assert_eq!(codes::CONNECT, 0x5517);
        assert_eq!(codes::RESET, 0x5514);
    }
}
