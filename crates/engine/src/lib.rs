//! usbfs request/completion engine
//!
//! Issues USB requests to a device through the Linux usbfs character device
//! and correlates asynchronous completions back to the transfers that
//! submitted them.
//!
//! # Architecture
//!
//! - **Device handle** (`UsbDevice`): opens the node, issues synchronous
//!   requests and submits asynchronous bulk URBs
//! - **Pending table**: key → in-flight transfer; owns each URB and its
//!   buffer until the kernel hands them back
//! - **Reaper**: one thread per handle that waits for completed URBs and
//!   fires each transfer's completion signal
//! - **Backend** (`UsbBackend`): the kernel seam; `Usbfs` for real nodes,
//!   `test_utils::MockKernel` for tests
//!
//! # Example
//!
//! ```no_run
//! use engine::{EngineConfig, UsbDevice};
//!
//! # async fn run() -> engine::Result<()> {
//! let mut device = UsbDevice::open_with_config("/dev/bus/usb/001/004", EngineConfig::default())?;
//! device.claim_interface(0)?;
//!
//! let transfer = device.bulk_transfer_async(0x81, 64, 1000, vec![0; 64]).await?;
//! println!("{} bytes: {:02x?}", transfer.actual_length, transfer.data());
//!
//! device.close()?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod device;
pub mod error;
mod pending;
pub mod reaper;
pub mod test_utils;
pub mod transfer;

pub use backend::{Completion, UsbBackend, Usbfs};
pub use config::{DEFAULT_POLL_INTERVAL, EngineConfig};
pub use device::UsbDevice;
pub use error::{Error, Result};
pub use reaper::{ReaperState, ReaperStats};
pub use transfer::{CompletionReceiver, CompletionSender, Transfer};
pub use usbdevfs::{Errno, RequestId};
