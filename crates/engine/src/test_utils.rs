//! Test utilities
//!
//! `MockKernel` implements `UsbBackend` in memory. It records every request
//! it receives, keeps submitted URBs "in the kernel" until a test completes
//! them, and hands completions to the reaper the same way usbfs does: by
//! writing status and length into the caller's URB and returning it on the
//! next reap.

use crate::backend::{Completion, UsbBackend};
use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use usbdevfs::{BulkTransfer, CtrlTransfer, Errno, RequestId, SetInterface, Urb, UsbIoctl};

/// A request as seen by the mock kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelCall {
    ClaimInterface(u32),
    ReleaseInterface(u32),
    SetConfiguration(u32),
    SetInterface {
        interface: u32,
        alt_setting: u32,
    },
    ClearHalt(u32),
    DriverIoctl {
        interface: i32,
        command: u32,
    },
    Reset,
    Control {
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
        timeout: u32,
    },
    Bulk {
        endpoint: u32,
        length: u32,
        timeout: u32,
    },
    SubmitUrb {
        key: RequestId,
        endpoint: u8,
        length: i32,
    },
    DiscardUrb {
        key: RequestId,
    },
    Close,
}

/// A URB the mock kernel has accepted and not yet completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmittedUrb {
    pub key: RequestId,
    pub endpoint: u8,
    pub buffer_length: i32,
}

struct QueuedUrb {
    /// Address of the caller's URB, which stays valid while queued
    urb: usize,
    info: SubmittedUrb,
}

#[derive(Default)]
struct MockState {
    calls: Vec<KernelCall>,
    queued: HashMap<RequestId, QueuedUrb>,
    submitted: Vec<SubmittedUrb>,
    completions: VecDeque<Completion>,
    fail_next: Option<Errno>,
    reap_error: Option<Errno>,
    control_response: Vec<u8>,
    bulk_response: Vec<u8>,
    closed: bool,
}

/// In-memory stand-in for a usbfs device node
#[derive(Default)]
pub struct MockKernel {
    state: Mutex<MockState>,
    changed: Condvar,
}

impl MockKernel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `call`, failing with the armed error or EBADF once closed
    fn record(&self, call: KernelCall) -> Result<MutexGuard<'_, MockState>, Errno> {
        let mut state = self.lock();
        if state.closed {
            return Err(Errno::EBADF);
        }
        state.calls.push(call);
        match state.fail_next.take() {
            Some(errno) => Err(errno),
            None => Ok(state),
        }
    }

    /// Every request received so far, in order (reaps are not recorded)
    pub fn calls(&self) -> Vec<KernelCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    /// Every URB ever accepted, in submission order
    pub fn submitted(&self) -> Vec<SubmittedUrb> {
        self.lock().submitted.clone()
    }

    /// URBs accepted and not yet completed, ordered by key
    pub fn in_flight(&self) -> Vec<SubmittedUrb> {
        let mut urbs: Vec<_> = self.lock().queued.values().map(|q| q.info).collect();
        urbs.sort_by_key(|u| u.key);
        urbs
    }

    /// Fail the next recorded request with `errno`
    pub fn fail_next(&self, errno: Errno) {
        self.lock().fail_next = Some(errno);
    }

    /// Make every subsequent reap fail with `errno`, as after a disconnect
    pub fn fail_reap(&self, errno: Errno) {
        self.lock().reap_error = Some(errno);
        self.changed.notify_all();
    }

    /// Bytes returned by device-to-host control transfers
    pub fn set_control_response(&self, data: &[u8]) {
        self.lock().control_response = data.to_vec();
    }

    /// Bytes returned by device-to-host synchronous bulk transfers
    pub fn set_bulk_response(&self, data: &[u8]) {
        self.lock().bulk_response = data.to_vec();
    }

    /// Complete a queued URB without touching its buffer
    ///
    /// Returns false if `key` is not queued.
    pub fn complete(&self, key: RequestId, status: i32, actual_length: i32) -> bool {
        let mut state = self.lock();
        let Some(queued) = state.queued.remove(&key) else {
            return false;
        };
        Self::finish(&mut state, &queued, status, actual_length);
        drop(state);
        self.changed.notify_all();
        true
    }

    /// Complete a queued URB, writing `data` into its buffer first
    ///
    /// The copy is clamped to the URB's buffer length. Returns false if `key`
    /// is not queued.
    pub fn complete_with_data(&self, key: RequestId, status: i32, data: &[u8]) -> bool {
        let mut state = self.lock();
        let Some(queued) = state.queued.remove(&key) else {
            return false;
        };

        let urb = queued.urb as *mut Urb;
        let capacity = usize::try_from(queued.info.buffer_length).unwrap_or(0);
        let len = data.len().min(capacity);
        // SAFETY: a queued URB and its buffer are owned by a live pending
        // entry, which is not freed before this URB is reaped or the mock is
        // closed. Both require the state lock held here.
        unsafe {
            let buffer = (*urb).buffer.cast::<u8>();
            std::ptr::copy_nonoverlapping(data.as_ptr(), buffer, len);
        }

        Self::finish(&mut state, &queued, status, len as i32);
        drop(state);
        self.changed.notify_all();
        true
    }

    /// Queue a completion that matches no submitted URB
    pub fn inject_completion(&self, key: RequestId, status: i32, actual_length: i32) {
        self.lock().completions.push_back(Completion {
            key,
            status,
            actual_length,
        });
        self.changed.notify_all();
    }

    /// Block until at least `count` URBs have been accepted in total
    pub fn wait_for_submissions(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while state.submitted.len() < count {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    fn finish(state: &mut MockState, queued: &QueuedUrb, status: i32, actual_length: i32) {
        let urb = queued.urb as *mut Urb;
        // SAFETY: see `complete_with_data`
        let key = unsafe {
            (*urb).status = status;
            (*urb).actual_length = actual_length;
            (*urb).request_id()
        };
        state.completions.push_back(Completion {
            key,
            status,
            actual_length,
        });
    }
}

impl UsbBackend for MockKernel {
    fn claim_interface(&self, interface: u32) -> nix::Result<()> {
        self.record(KernelCall::ClaimInterface(interface)).map(drop)
    }

    fn release_interface(&self, interface: u32) -> nix::Result<()> {
        self.record(KernelCall::ReleaseInterface(interface)).map(drop)
    }

    fn set_configuration(&self, configuration: u32) -> nix::Result<()> {
        self.record(KernelCall::SetConfiguration(configuration)).map(drop)
    }

    fn set_interface(&self, request: &SetInterface) -> nix::Result<()> {
        self.record(KernelCall::SetInterface {
            interface: request.interface,
            alt_setting: request.alt_setting,
        })
        .map(drop)
    }

    fn clear_halt(&self, endpoint: u32) -> nix::Result<()> {
        self.record(KernelCall::ClearHalt(endpoint)).map(drop)
    }

    fn reset(&self) -> nix::Result<()> {
        self.record(KernelCall::Reset).map(drop)
    }

    unsafe fn driver_ioctl(&self, request: &mut UsbIoctl) -> nix::Result<i32> {
        self.record(KernelCall::DriverIoctl {
            interface: request.interface,
            command: request.command as u32,
        })
        .map(|_| 0)
    }

    unsafe fn control(&self, request: &mut CtrlTransfer) -> nix::Result<usize> {
        let state = self.record(KernelCall::Control {
            request_type: request.request_type,
            request: request.request,
            value: request.value,
            index: request.index,
            length: request.length,
            timeout: request.timeout,
        })?;

        let length = usize::from(request.length);
        if !request.is_in() {
            return Ok(length);
        }
        let len = state.control_response.len().min(length);
        // SAFETY: caller guarantees `data` holds `length` bytes
        unsafe {
            std::ptr::copy_nonoverlapping(
                state.control_response.as_ptr(),
                request.data.cast::<u8>(),
                len,
            );
        }
        Ok(len)
    }

    unsafe fn bulk(&self, request: &mut BulkTransfer) -> nix::Result<usize> {
        let state = self.record(KernelCall::Bulk {
            endpoint: request.endpoint,
            length: request.length,
            timeout: request.timeout,
        })?;

        let length = request.length as usize;
        if !request.is_in() {
            return Ok(length);
        }
        let len = state.bulk_response.len().min(length);
        // SAFETY: caller guarantees `data` holds `length` bytes
        unsafe {
            std::ptr::copy_nonoverlapping(
                state.bulk_response.as_ptr(),
                request.data.cast::<u8>(),
                len,
            );
        }
        Ok(len)
    }

    unsafe fn submit_urb(&self, urb: *mut Urb) -> nix::Result<()> {
        // SAFETY: caller guarantees `urb` is valid until reaped
        let (key, endpoint, buffer_length) = unsafe {
            let urb = &*urb;
            (urb.request_id(), urb.endpoint, urb.buffer_length)
        };

        let mut state = self.record(KernelCall::SubmitUrb {
            key,
            endpoint,
            length: buffer_length,
        })?;

        let info = SubmittedUrb {
            key,
            endpoint,
            buffer_length,
        };
        state.submitted.push(info);
        state.queued.insert(
            key,
            QueuedUrb {
                urb: urb as usize,
                info,
            },
        );
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    unsafe fn discard_urb(&self, urb: *mut Urb) -> nix::Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(Errno::EBADF);
        }
        let key = state
            .queued
            .values()
            .find(|q| q.urb == urb as usize)
            .map(|q| q.info.key)
            .ok_or(Errno::EINVAL)?;

        state.calls.push(KernelCall::DiscardUrb { key });
        if let Some(errno) = state.fail_next.take() {
            return Err(errno);
        }
        if let Some(queued) = state.queued.remove(&key) {
            Self::finish(&mut state, &queued, -(Errno::ENOENT as i32), 0);
        }
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    fn reap(&self, timeout: Duration) -> nix::Result<Option<Completion>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(Errno::EBADF);
            }
            if let Some(errno) = state.reap_error {
                return Err(errno);
            }
            if let Some(completion) = state.completions.pop_front() {
                return Ok(Some(completion));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn close(&self) -> nix::Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(Errno::EBADF);
        }
        state.calls.push(KernelCall::Close);
        state.closed = true;
        // The kernel drops queued and unreaped URBs with the descriptor
        state.queued.clear();
        state.completions.clear();
        drop(state);
        self.changed.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_calls_in_order() {
        let kernel = MockKernel::new();
        kernel.claim_interface(0).unwrap();
        kernel.reset().unwrap();
        assert_eq!(
            kernel.calls(),
            vec![KernelCall::ClaimInterface(0), KernelCall::Reset]
        );
    }

    #[test]
    fn test_fail_next_applies_once() {
        let kernel = MockKernel::new();
        kernel.fail_next(Errno::EBUSY);
        assert_eq!(kernel.claim_interface(0), Err(Errno::EBUSY));
        assert_eq!(kernel.claim_interface(0), Ok(()));
        assert_eq!(kernel.call_count(), 2);
    }

    #[test]
    fn test_reap_times_out_empty() {
        let kernel = MockKernel::new();
        assert_eq!(kernel.reap(Duration::from_millis(1)), Ok(None));
    }

    #[test]
    fn test_injected_completion_is_reaped() {
        let kernel = MockKernel::new();
        kernel.inject_completion(RequestId(9), -71, 0);
        let completion = kernel.reap(Duration::from_millis(1)).unwrap().unwrap();
        assert_eq!(completion.key, RequestId(9));
        assert_eq!(completion.status, -71);
    }

    #[test]
    fn test_complete_writes_urb() {
        let kernel = MockKernel::new();
        let mut buffer = vec![0u8; 8];
        let mut urb = Urb::bulk(0x81, buffer.as_mut_ptr(), 8, RequestId(3));

        // SAFETY: `urb` and `buffer` outlive every use below
        unsafe { kernel.submit_urb(&mut urb).unwrap() };
        assert_eq!(kernel.in_flight().len(), 1);
        assert!(kernel.complete_with_data(RequestId(3), 0, &[1, 2, 3, 4, 5, 6, 7, 8, 9]));
        assert!(!kernel.complete(RequestId(3), 0, 0));

        let completion = kernel.reap(Duration::from_millis(1)).unwrap().unwrap();
        assert_eq!(completion.actual_length, 8);
        assert_eq!(urb.actual_length, 8);
        assert_eq!(buffer, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_close_is_single_shot() {
        let kernel = MockKernel::new();
        assert_eq!(kernel.close(), Ok(()));
        assert_eq!(kernel.close(), Err(Errno::EBADF));
        assert_eq!(kernel.reset(), Err(Errno::EBADF));
        assert_eq!(kernel.calls(), vec![KernelCall::Close]);
    }
}
