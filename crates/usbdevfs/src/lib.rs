//! Linux usbfs kernel interface
//!
//! Fixed-layout request structures and ioctl entry points for the
//! `/dev/bus/usb/BBB/DDD` character devices. Nothing here owns a descriptor
//! or tracks state; the engine crate builds on these primitives.
//!
//! # Example
//!
//! ```
//! use usbdevfs::{RequestId, Urb, URB_TYPE_BULK};
//!
//! let mut buf = vec![0u8; 64];
//! let urb = Urb::bulk(0x81, buf.as_mut_ptr(), 64, RequestId(1));
//! assert_eq!(urb.urb_type, URB_TYPE_BULK);
//! assert_eq!(urb.request_id(), RequestId(1));
//! ```

pub mod ioctl;
pub mod types;

pub use ioctl::codes;
pub use types::{
    BulkTransfer, CtrlTransfer, RequestId, SetInterface, URB_TYPE_BULK, URB_TYPE_CONTROL,
    URB_TYPE_INTERRUPT, URB_TYPE_ISO, Urb, UsbIoctl,
};

/// Re-exported so dependents name kernel errors with the same type
pub use nix::errno::Errno;
