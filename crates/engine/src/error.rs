//! Engine error types

use std::path::PathBuf;
use thiserror::Error;
use usbdevfs::{Errno, RequestId};

/// Errors reported by a device handle
///
/// `Clone` so that a single failure can be delivered to every waiter that is
/// still holding a completion signal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The usbfs node could not be opened for read/write
    #[error("Device unavailable: {}: {reason}", .path.display())]
    DeviceUnavailable { path: PathBuf, reason: String },

    /// Requested length exceeds the supplied buffer; no kernel call was made
    #[error("Buffer too small: requested {requested} bytes, buffer holds {capacity}")]
    BufferTooSmall { requested: usize, capacity: usize },

    /// Requested length does not fit the kernel's signed length field
    #[error("Transfer length {length} exceeds the kernel limit")]
    LengthOverflow { length: usize },

    /// A kernel request returned an error; `errno` is passed through unmodified
    #[error("{operation} failed: {errno}")]
    KernelRequestFailed {
        operation: &'static str,
        errno: Errno,
    },

    /// The kernel reported a completion for a key that was never registered
    #[error("Protocol violation: completion for unregistered request {key}")]
    ProtocolViolation { key: RequestId },

    /// The completion wait failed; no further completions will be delivered
    #[error("Reaper terminated: {errno}")]
    ReaperTerminated { errno: Errno },

    /// The reaper thread could not be started
    #[error("Failed to spawn reaper thread: {reason}")]
    ReaperSpawn { reason: String },

    /// `close` called on a handle that is already closed
    #[error("Device handle already closed")]
    AlreadyClosed,

    /// Operation issued on a closed handle
    #[error("Device handle is not open")]
    NotOpen,

    /// The handle was closed while this transfer was still outstanding
    #[error("Transfer {key} cancelled: device handle closed")]
    Cancelled { key: RequestId },

    /// No in-flight transfer has this key
    #[error("Unknown transfer {key}")]
    UnknownTransfer { key: RequestId },
}

impl Error {
    pub(crate) fn kernel(operation: &'static str, errno: Errno) -> Self {
        Error::KernelRequestFailed { operation, errno }
    }

    /// Kernel error code carried by this error, if any
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Error::KernelRequestFailed { errno, .. } | Error::ReaperTerminated { errno } => {
                Some(*errno)
            }
            _ => None,
        }
    }
}

/// Type alias for engine results
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_too_small_display() {
        let err = Error::BufferTooSmall {
            requested: 128,
            capacity: 64,
        };
        let msg = err.to_string();
        assert!(msg.contains("128"));
        assert!(msg.contains("64"));
    }

    #[test]
    fn test_kernel_errno_passthrough() {
        let err = Error::kernel("claim interface", Errno::EBUSY);
        assert_eq!(err.errno(), Some(Errno::EBUSY));
        assert!(err.to_string().starts_with("claim interface failed"));
        assert_eq!(Error::AlreadyClosed.errno(), None);
    }

    #[test]
    fn test_device_unavailable_display() {
        let err = Error::DeviceUnavailable {
            path: PathBuf::from("/dev/bus/usb/001/004"),
            reason: "Permission denied".to_string(),
        };
        assert!(err.to_string().contains("/dev/bus/usb/001/004"));
    }
}
