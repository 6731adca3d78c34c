//! Kernel backend
//!
//! `UsbBackend` is the seam between the engine and the kernel's usbfs request
//! queue: one method per ioctl the engine issues. `Usbfs` drives a real
//! `/dev/bus/usb/BBB/DDD` node; `test_utils::MockKernel` stands in for it in
//! tests.

use crate::error::{Error, Result};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::ffi::c_uint;
use std::fs::OpenOptions;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, error};
use usbdevfs::{BulkTransfer, CtrlTransfer, Errno, RequestId, SetInterface, Urb, UsbIoctl, ioctl};

/// A completed URB as reported by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Key read back from the URB's `usercontext`
    pub key: RequestId,
    /// 0 or a negative errno
    pub status: i32,
    pub actual_length: i32,
}

/// Operations the engine issues against one device's kernel request queue
///
/// All methods return the kernel's errno unmodified on failure.
pub trait UsbBackend: Send + Sync {
    fn claim_interface(&self, interface: u32) -> nix::Result<()>;

    fn release_interface(&self, interface: u32) -> nix::Result<()>;

    fn set_configuration(&self, configuration: u32) -> nix::Result<()>;

    fn set_interface(&self, request: &SetInterface) -> nix::Result<()>;

    fn clear_halt(&self, endpoint: u32) -> nix::Result<()>;

    fn reset(&self) -> nix::Result<()>;

    /// Forward a driver-control command to the driver bound to an interface
    ///
    /// # Safety
    /// `request.data` must be null or valid for whatever the command reads
    /// and writes.
    unsafe fn driver_ioctl(&self, request: &mut UsbIoctl) -> nix::Result<i32>;

    /// Synchronous control transfer, returning bytes transferred
    ///
    /// # Safety
    /// `request.data` must be valid for reads and writes of `request.length`
    /// bytes for the duration of the call.
    unsafe fn control(&self, request: &mut CtrlTransfer) -> nix::Result<usize>;

    /// Synchronous bulk transfer, returning bytes transferred
    ///
    /// # Safety
    /// `request.data` must be valid for reads and writes of `request.length`
    /// bytes for the duration of the call.
    unsafe fn bulk(&self, request: &mut BulkTransfer) -> nix::Result<usize>;

    /// Queue an asynchronous URB
    ///
    /// # Safety
    /// `urb` and the buffer it points to must stay valid and unmoved until
    /// the URB is returned by `reap` or the backend is closed.
    unsafe fn submit_urb(&self, urb: *mut Urb) -> nix::Result<()>;

    /// Ask the kernel to cancel a queued URB; it is still reaped afterwards
    ///
    /// # Safety
    /// `urb` must be an address previously passed to `submit_urb`. It is used
    /// only as an identifier.
    unsafe fn discard_urb(&self, urb: *mut Urb) -> nix::Result<()>;

    /// Wait up to `timeout` for one completed URB
    ///
    /// `Ok(None)` means nothing completed in time. An error is fatal for the
    /// completion queue (for example `ENODEV` after disconnect).
    fn reap(&self, timeout: Duration) -> nix::Result<Option<Completion>>;

    /// Release the descriptor; the kernel cancels anything still queued
    fn close(&self) -> nix::Result<()>;
}

/// usbfs character device backend
pub struct Usbfs {
    path: PathBuf,
    /// `None` once closed. Ioctls hold the read lock, so `close` waits for
    /// calls already in progress.
    fd: RwLock<Option<OwnedFd>>,
}

impl Usbfs {
    /// Open a usbfs node for read/write
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                debug!("Failed to open {}: {}", path.display(), e);
                Error::DeviceUnavailable {
                    path: path.clone(),
                    reason: e.to_string(),
                }
            })?;

        debug!("Opened usbfs device {}", path.display());
        Ok(Self {
            path,
            fd: RwLock::new(Some(OwnedFd::from(file))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_fd<T>(&self, f: impl FnOnce(BorrowedFd<'_>) -> nix::Result<T>) -> nix::Result<T> {
        let guard = self.fd.read().unwrap_or_else(PoisonError::into_inner);
        let fd = guard.as_ref().ok_or(Errno::EBADF)?;
        f(fd.as_fd())
    }

    fn reap_ndelay(fd: BorrowedFd<'_>) -> nix::Result<Option<Completion>> {
        let mut urb: *mut Urb = std::ptr::null_mut();
        // SAFETY: the kernel writes one pointer into `urb`
        match unsafe { ioctl::reap_urb_ndelay(fd.as_raw_fd(), &mut urb) } {
            Ok(_) => {
                // SAFETY: the kernel only returns URBs submitted on this
                // descriptor, and the pending table keeps each one alive
                // until its completion has been dispatched.
                let urb = unsafe { &*urb };
                Ok(Some(Completion {
                    key: urb.request_id(),
                    status: urb.status,
                    actual_length: urb.actual_length,
                }))
            }
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl UsbBackend for Usbfs {
    fn claim_interface(&self, interface: u32) -> nix::Result<()> {
        let mut n: c_uint = interface;
        // SAFETY: `n` is a live c_uint for the duration of the call
        self.with_fd(|fd| unsafe { ioctl::claim_interface(fd.as_raw_fd(), &mut n) })
            .map(drop)
    }

    fn release_interface(&self, interface: u32) -> nix::Result<()> {
        let mut n: c_uint = interface;
        // SAFETY: as above
        self.with_fd(|fd| unsafe { ioctl::release_interface(fd.as_raw_fd(), &mut n) })
            .map(drop)
    }

    fn set_configuration(&self, configuration: u32) -> nix::Result<()> {
        let mut n: c_uint = configuration;
        // SAFETY: as above
        self.with_fd(|fd| unsafe { ioctl::set_configuration(fd.as_raw_fd(), &mut n) })
            .map(drop)
    }

    fn set_interface(&self, request: &SetInterface) -> nix::Result<()> {
        let mut request = *request;
        // SAFETY: `request` is a live SetInterface for the duration of the call
        self.with_fd(|fd| unsafe { ioctl::set_interface(fd.as_raw_fd(), &mut request) })
            .map(drop)
    }

    fn clear_halt(&self, endpoint: u32) -> nix::Result<()> {
        let mut n: c_uint = endpoint;
        // SAFETY: as above
        self.with_fd(|fd| unsafe { ioctl::clear_halt(fd.as_raw_fd(), &mut n) })
            .map(drop)
    }

    fn reset(&self) -> nix::Result<()> {
        // SAFETY: no argument
        self.with_fd(|fd| unsafe { ioctl::reset(fd.as_raw_fd()) })
            .map(drop)
    }

    unsafe fn driver_ioctl(&self, request: &mut UsbIoctl) -> nix::Result<i32> {
        // SAFETY: caller guarantees `request.data`
        self.with_fd(|fd| unsafe { ioctl::driver_ioctl(fd.as_raw_fd(), request) })
    }

    unsafe fn control(&self, request: &mut CtrlTransfer) -> nix::Result<usize> {
        // SAFETY: caller guarantees `request.data`
        self.with_fd(|fd| unsafe { ioctl::control(fd.as_raw_fd(), request) })
            .map(|n| n as usize)
    }

    unsafe fn bulk(&self, request: &mut BulkTransfer) -> nix::Result<usize> {
        // SAFETY: caller guarantees `request.data`
        self.with_fd(|fd| unsafe { ioctl::bulk(fd.as_raw_fd(), request) })
            .map(|n| n as usize)
    }

    unsafe fn submit_urb(&self, urb: *mut Urb) -> nix::Result<()> {
        // SAFETY: caller guarantees `urb` outlives the request
        self.with_fd(|fd| unsafe { ioctl::submit_urb(fd.as_raw_fd(), urb) })
            .map(drop)
    }

    unsafe fn discard_urb(&self, urb: *mut Urb) -> nix::Result<()> {
        // SAFETY: the kernel matches `urb` by address and never dereferences it
        self.with_fd(|fd| unsafe { ioctl::discard_urb(fd.as_raw_fd(), urb) })
            .map(drop)
    }

    fn reap(&self, timeout: Duration) -> nix::Result<Option<Completion>> {
        self.with_fd(|fd| {
            if let Some(completion) = Self::reap_ndelay(fd)? {
                return Ok(Some(completion));
            }

            // usbfs reports completed URBs as writable; HUP/ERR after
            // disconnect makes the next reap fail with ENODEV
            let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
            let mut fds = [PollFd::new(fd, PollFlags::POLLOUT)];
            match poll(&mut fds, PollTimeout::from(millis)) {
                Ok(0) | Err(Errno::EINTR) => return Ok(None),
                Ok(_) => {}
                Err(e) => {
                    error!("poll on {} failed: {}", self.path.display(), e);
                    return Err(e);
                }
            }

            Self::reap_ndelay(fd)
        })
    }

    fn close(&self) -> nix::Result<()> {
        let mut guard = self.fd.write().unwrap_or_else(PoisonError::into_inner);
        match guard.take() {
            Some(fd) => {
                drop(fd);
                debug!("Closed usbfs device {}", self.path.display());
                Ok(())
            }
            None => Err(Errno::EBADF),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_path() {
        let result = Usbfs::open("/dev/bus/usb/999/999");
        match result {
            Err(Error::DeviceUnavailable { path, .. }) => {
                assert_eq!(path, PathBuf::from("/dev/bus/usb/999/999"));
            }
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("opened a nonexistent device"),
        }
    }

    #[test]
    fn test_closed_backend_reports_ebadf() {
        // Any readable+writable file exercises the descriptor lifecycle
        let backend = Usbfs::open("/dev/null").unwrap();
        assert_eq!(backend.close(), Ok(()));
        assert_eq!(backend.close(), Err(Errno::EBADF));
        assert_eq!(backend.claim_interface(0), Err(Errno::EBADF));
        assert_eq!(backend.reap(Duration::from_millis(1)), Err(Errno::EBADF));
    }

    #[test]
    fn test_ioctl_on_non_usb_node_fails() {
        let backend = Usbfs::open("/dev/null").unwrap();
        // /dev/null does not implement usbfs ioctls
        assert!(backend.claim_interface(0).is_err());
        assert!(backend.set_configuration(1).is_err());
    }
}
