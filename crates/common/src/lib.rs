//! Common utilities for usbfs-engine
//!
//! Shared functionality between the engine and the command-line tool:
//! error handling, logging setup, and device discovery over the USB bus
//! (which produces the usbfs paths the engine opens).

pub mod discovery;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use discovery::{DeviceInfo, DeviceSpeed, list_devices, parse_vid_pid, usbfs_path};
pub use error::{Error, Result};
pub use logging::setup_logging;
