//! Transfer records
//!
//! A `Transfer` is what the caller gets back once an asynchronous request has
//! been reaped. While the request is in flight the engine holds it as an
//! `InFlight` entry in the pending table, which owns the URB and the data
//! buffer so both stay at fixed addresses until the kernel hands them back.

use crate::error::{Error, Result};
use std::ffi::c_int;
use std::ptr::NonNull;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use usbdevfs::{Errno, RequestId, Urb};

/// Single-shot completion signal for one asynchronous transfer
pub type CompletionSender = oneshot::Sender<Result<Transfer>>;

/// Receiving side of a completion signal
pub type CompletionReceiver = oneshot::Receiver<Result<Transfer>>;

/// A completed asynchronous transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    /// Correlation key assigned at submission
    pub id: RequestId,
    /// Endpoint address, including the direction bit
    pub endpoint: u8,
    /// 0 on success, otherwise the kernel's negative errno
    pub status: i32,
    /// Bytes actually transferred
    pub actual_length: usize,
    /// Timeout requested by the caller (usbfs URBs carry no timeout of their own)
    pub timeout_ms: u32,
    /// The caller's buffer, returned after completion
    pub buffer: Vec<u8>,
}

impl Transfer {
    pub fn is_success(&self) -> bool {
        self.status == 0
    }

    /// Bytes actually transferred
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.actual_length.min(self.buffer.len())]
    }

    /// Kernel error for a failed transfer
    pub fn errno(&self) -> Option<Errno> {
        (self.status != 0).then(|| Errno::from_raw(self.status.saturating_neg()))
    }

    /// Consume the record, keeping only the transferred bytes
    pub fn into_data(mut self) -> Vec<u8> {
        let len = self.actual_length.min(self.buffer.len());
        self.buffer.truncate(len);
        self.buffer
    }

    pub fn is_in(&self) -> bool {
        self.endpoint & 0x80 != 0
    }
}

/// A submitted request that has not been reaped yet
pub(crate) struct InFlight {
    /// Leaked box; freed in `Drop`
    urb: NonNull<Urb>,
    buffer: Vec<u8>,
    endpoint: u8,
    timeout_ms: u32,
    completion: Option<CompletionSender>,
}

// SAFETY: the raw pointers inside the URB refer to memory owned by this entry
// (the URB box and `buffer`). Nothing else dereferences them on the Rust side
// while the entry is alive, so moving the entry between threads is sound.
unsafe impl Send for InFlight {}

impl InFlight {
    pub(crate) fn bulk(
        id: RequestId,
        endpoint: u8,
        buffer_length: c_int,
        timeout_ms: u32,
        mut buffer: Vec<u8>,
        completion: Option<CompletionSender>,
    ) -> Self {
        let urb = Box::new(Urb::bulk(endpoint, buffer.as_mut_ptr(), buffer_length, id));
        Self {
            urb: NonNull::from(Box::leak(urb)),
            buffer,
            endpoint,
            timeout_ms,
            completion,
        }
    }

    /// Stable address of the URB handed to the kernel
    pub(crate) fn urb_ptr(&self) -> NonNull<Urb> {
        self.urb
    }

    #[cfg(test)]
    pub(crate) fn has_completion(&self) -> bool {
        self.completion.is_some()
    }

    /// Copy the kernel's report into a `Transfer` and signal the waiter
    pub(crate) fn deliver(mut self, id: RequestId, status: i32, actual_length: i32) {
        let transfer = Transfer {
            id,
            endpoint: self.endpoint,
            status,
            actual_length: usize::try_from(actual_length).unwrap_or(0),
            timeout_ms: self.timeout_ms,
            buffer: std::mem::take(&mut self.buffer),
        };

        if status != 0 {
            warn!(
                "Transfer {} on ep {:#04x} completed with status {}",
                id, self.endpoint, status
            );
        }

        match self.completion.take() {
            Some(tx) => {
                if tx.send(Ok(transfer)).is_err() {
                    debug!("Completion receiver for {} dropped", id);
                }
            }
            None => debug!("Transfer {} completed (fire-and-forget)", id),
        }
    }

    /// Signal the waiter with `error`, keeping URB and buffer alive in `self`
    pub(crate) fn fail(&mut self, error: Error) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(Err(error));
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        // SAFETY: `urb` came from `Box::leak` in `bulk` and is freed only here.
        // Entries are dropped only once the kernel no longer references the
        // URB: after its completion was reaped, after a failed submission, or
        // after the descriptor was closed.
        unsafe { drop(Box::from_raw(self.urb.as_ptr())) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(status: i32, actual_length: usize) -> Transfer {
        Transfer {
            id: RequestId(1),
            endpoint: 0x81,
            status,
            actual_length,
            timeout_ms: 1000,
            buffer: vec![0xAA; 64],
        }
    }

    #[test]
    fn test_transfer_data_is_truncated() {
        let t = transfer(0, 10);
        assert_eq!(t.data().len(), 10);
        assert_eq!(t.into_data().len(), 10);
    }

    #[test]
    fn test_transfer_errno() {
        assert_eq!(transfer(0, 0).errno(), None);
        assert_eq!(transfer(-32, 0).errno(), Some(Errno::EPIPE));
        assert!(!transfer(-32, 0).is_success());
    }

    #[test]
    fn test_actual_length_beyond_buffer() {
        let t = transfer(0, 1000);
        assert_eq!(t.data().len(), 64);
    }

    #[test]
    fn test_deliver_sends_record() {
        let (tx, mut rx) = oneshot::channel();
        let entry = InFlight::bulk(RequestId(3), 0x81, 64, 500, vec![0; 64], Some(tx));
        entry.deliver(RequestId(3), 0, 64);

        let t = rx.try_recv().unwrap().unwrap();
        assert_eq!(t.id, RequestId(3));
        assert_eq!(t.actual_length, 64);
        assert_eq!(t.timeout_ms, 500);
        assert_eq!(t.buffer.len(), 64);
    }

    #[test]
    fn test_fail_sends_error_once() {
        let (tx, mut rx) = oneshot::channel();
        let mut entry = InFlight::bulk(RequestId(4), 0x02, 8, 0, vec![0; 8], Some(tx));
        entry.fail(Error::Cancelled { key: RequestId(4) });
        assert!(!entry.has_completion());

        let err = rx.try_recv().unwrap().unwrap_err();
        assert_eq!(err, Error::Cancelled { key: RequestId(4) });
    }

    #[test]
    fn test_urb_points_at_buffer() {
        let entry = InFlight::bulk(RequestId(5), 0x81, 16, 0, vec![0; 16], None);
        // SAFETY: the URB is owned by `entry` and nothing else touches it
        let urb = unsafe { entry.urb_ptr().as_ref() };
        assert_eq!(urb.buffer.cast::<u8>(), entry.buffer.as_ptr().cast_mut());
        assert_eq!(urb.request_id(), RequestId(5));
    }
}
