//! USB device handle
//!
//! `UsbDevice` owns one open usbfs descriptor (through its backend), the
//! pending table, and the reaper thread that drains completions for it.
//!
//! Synchronous operations (configuration calls, control transfers and the
//! blocking bulk form) go straight to the kernel and return its result. The
//! asynchronous bulk form registers the transfer in the pending table under a
//! fresh key, then queues the URB; the reaper later matches the completion by
//! that key and fires the caller's completion signal.
//!
//! `close` takes `&mut self`, so it cannot overlap a submission or another
//! operation on the same handle.

use crate::backend::{UsbBackend, Usbfs};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::reaper::{ReaperHandle, ReaperState, ReaperStats, Shared};
use crate::transfer::{CompletionSender, InFlight, Transfer};
use common::discovery;
use std::ffi::c_int;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};
use usbdevfs::{BulkTransfer, CtrlTransfer, RequestId, SetInterface, UsbIoctl, codes};

/// One open USB device
pub struct UsbDevice {
    backend: Arc<dyn UsbBackend>,
    shared: Arc<Shared>,
    reaper: Option<ReaperHandle>,
    open: bool,
}

impl UsbDevice {
    /// Open a usbfs node with default settings
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, EngineConfig::default())
    }

    /// Open a usbfs node
    ///
    /// Fails with `DeviceUnavailable` if the node cannot be opened read/write.
    pub fn open_with_config(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self> {
        let backend = Usbfs::open(path.as_ref())?;
        info!("Opened USB device {}", path.as_ref().display());
        Self::with_backend(Arc::new(backend), config)
    }

    /// Open the first device on the bus with the given VID:PID
    pub fn open_vid_pid(vendor_id: u16, product_id: u16, config: EngineConfig) -> Result<Self> {
        let info = discovery::find_by_vid_pid(vendor_id, product_id).map_err(|e| {
            Error::DeviceUnavailable {
                path: PathBuf::from(discovery::USBFS_ROOT),
                reason: e.to_string(),
            }
        })?;
        Self::open_with_config(&info.devpath, config)
    }

    /// Open the device at the given bus number and address
    pub fn open_bus_dev(bus_number: u8, device_address: u8, config: EngineConfig) -> Result<Self> {
        let info = discovery::find_by_bus_dev(bus_number, device_address).map_err(|e| {
            Error::DeviceUnavailable {
                path: discovery::usbfs_path(bus_number, device_address),
                reason: e.to_string(),
            }
        })?;
        Self::open_with_config(&info.devpath, config)
    }

    /// Build a handle over an already-open backend and start its reaper
    pub fn with_backend(backend: Arc<dyn UsbBackend>, config: EngineConfig) -> Result<Self> {
        let shared = Arc::new(Shared::new());
        let reaper = ReaperHandle::spawn(backend.clone(), shared.clone(), &config)?;

        Ok(Self {
            backend,
            shared,
            reaper: Some(reaper),
            open: true,
        })
    }

    /// Stop the reaper, release the descriptor, and fail outstanding transfers
    ///
    /// Transfers still pending receive `Error::Cancelled`. A second call
    /// returns `Error::AlreadyClosed` without touching the descriptor.
    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Err(Error::AlreadyClosed);
        }
        self.open = false;

        let exit = self.reaper.take().map(ReaperHandle::stop);
        debug!("Reaper exited with {:?}", exit);

        // The kernel cancels and forgets every queued URB when the descriptor
        // is released, so abandoned entries can be freed afterwards.
        let result = self
            .backend
            .close()
            .map_err(|errno| Error::kernel("close", errno));

        let cancelled = self
            .shared
            .table
            .abandon_all(Error::NotOpen, |key| Error::Cancelled { key });
        let released = self.shared.table.release_orphans();
        if cancelled > 0 {
            warn!("Cancelled {} outstanding transfers on close", cancelled);
        }

        self.shared.state.send_if_modified(|state| {
            if state.is_running() {
                *state = ReaperState::Stopped;
                true
            } else {
                false
            }
        });

        info!("Closed USB device ({} transfers released)", released);
        result
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open { Ok(()) } else { Err(Error::NotOpen) }
    }

    /// Claim an interface
    ///
    /// Required before transfers on any endpoint other than 0.
    pub fn claim_interface(&self, interface: u8) -> Result<()> {
        self.ensure_open()?;
        self.backend
            .claim_interface(interface.into())
            .map_err(|e| Error::kernel("claim interface", e))?;
        debug!("Claimed interface {}", interface);
        Ok(())
    }

    pub fn release_interface(&self, interface: u8) -> Result<()> {
        self.ensure_open()?;
        self.backend
            .release_interface(interface.into())
            .map_err(|e| Error::kernel("release interface", e))?;
        debug!("Released interface {}", interface);
        Ok(())
    }

    pub fn set_configuration(&self, configuration: u8) -> Result<()> {
        self.ensure_open()?;
        self.backend
            .set_configuration(configuration.into())
            .map_err(|e| Error::kernel("set configuration", e))?;
        debug!("Set configuration {}", configuration);
        Ok(())
    }

    /// Select an alternate setting for a claimed interface
    pub fn set_interface(&self, interface: u8, alt_setting: u8) -> Result<()> {
        self.ensure_open()?;
        let request = SetInterface {
            interface: interface.into(),
            alt_setting: alt_setting.into(),
        };
        self.backend
            .set_interface(&request)
            .map_err(|e| Error::kernel("set interface", e))?;
        debug!("Interface {} set to alt setting {}", interface, alt_setting);
        Ok(())
    }

    /// Clear a halt/stall condition on an endpoint
    pub fn clear_halt(&self, endpoint: u8) -> Result<()> {
        self.ensure_open()?;
        self.backend
            .clear_halt(endpoint.into())
            .map_err(|e| Error::kernel("clear halt", e))?;
        debug!("Cleared halt on ep {:#04x}", endpoint);
        Ok(())
    }

    /// Detach the kernel driver bound to an interface
    pub fn disconnect_driver(&self, interface: u8) -> Result<()> {
        self.driver_command(interface, codes::DISCONNECT, "disconnect driver")
    }

    /// Let the kernel rebind a driver to an interface
    pub fn connect_driver(&self, interface: u8) -> Result<()> {
        self.driver_command(interface, codes::CONNECT, "connect driver")
    }

    fn driver_command(&self, interface: u8, command: u32, operation: &'static str) -> Result<()> {
        self.ensure_open()?;
        let mut request = UsbIoctl::new(interface, command);
        // SAFETY: DISCONNECT and CONNECT take no data; `request.data` is null
        unsafe { self.backend.driver_ioctl(&mut request) }
            .map_err(|e| Error::kernel(operation, e))?;
        debug!("{} on interface {}", operation, interface);
        Ok(())
    }

    /// Port-reset the device
    pub fn reset(&self) -> Result<()> {
        self.ensure_open()?;
        self.backend
            .reset()
            .map_err(|e| Error::kernel("reset", e))?;
        debug!("Reset device");
        Ok(())
    }

    /// Synchronous control transfer on endpoint 0
    ///
    /// For device-to-host requests (bit 7 of `request_type` set) the reply is
    /// written into `buffer`. Fails with `BufferTooSmall`, before any kernel
    /// call, if `length` exceeds `buffer.len()`. Returns bytes transferred.
    #[allow(clippy::too_many_arguments)]
    pub fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
        timeout: u32,
        buffer: &mut [u8],
    ) -> Result<usize> {
        check_bounds(length.into(), buffer.len())?;
        self.ensure_open()?;

        let mut ctrl = CtrlTransfer::new(
            request_type,
            request,
            value,
            index,
            length,
            timeout,
            buffer.as_mut_ptr().cast(),
        );
        debug!(
            "Control transfer: request_type={:#04x}, request={:#04x}, value={:#06x}, index={:#06x}, length={}",
            request_type, request, value, index, length
        );

        // SAFETY: `ctrl.data` points into `buffer`, which holds at least
        // `length` bytes and is borrowed mutably for the whole call
        let transferred = unsafe { self.backend.control(&mut ctrl) }.map_err(|e| {
            warn!("Control transfer failed: {}", e);
            Error::kernel("control transfer", e)
        })?;

        debug!("Control transfer succeeded: {} bytes", transferred);
        Ok(transferred)
    }

    /// Synchronous bulk transfer, blocking until the kernel completes it
    ///
    /// Returns the bytes transferred and a copy of that prefix of `buffer`.
    /// Fails with `BufferTooSmall`, before any kernel call, if `length`
    /// exceeds `buffer.len()`.
    pub fn bulk_transfer(
        &self,
        endpoint: u8,
        length: u32,
        timeout: u32,
        buffer: &mut [u8],
    ) -> Result<(usize, Vec<u8>)> {
        check_bounds(length as usize, buffer.len())?;
        self.ensure_open()?;

        let mut bulk = BulkTransfer::new(endpoint, length, timeout, buffer.as_mut_ptr().cast());
        debug!(
            "Bulk transfer: endpoint={:#04x}, length={}, timeout={}ms",
            endpoint, length, timeout
        );

        // SAFETY: `bulk.data` points into `buffer`, which holds at least
        // `length` bytes and is borrowed mutably for the whole call
        let transferred = unsafe { self.backend.bulk(&mut bulk) }.map_err(|e| {
            warn!("Bulk transfer on ep {:#04x} failed: {}", endpoint, e);
            Error::kernel("bulk transfer", e)
        })?;

        let transferred = transferred.min(buffer.len());
        debug!("Bulk transfer succeeded: {} bytes", transferred);
        Ok((transferred, buffer[..transferred].to_vec()))
    }

    /// Queue an asynchronous bulk transfer and return immediately
    ///
    /// The engine takes `buffer` and hands it back inside the completed
    /// `Transfer`. With `completion` set, exactly one message is sent on it:
    /// the completed transfer, `ReaperTerminated`, or `Cancelled` if the
    /// handle is closed first. With `None`, the result is discarded. If the
    /// submission itself fails, the error is returned and `completion` is
    /// dropped unsent.
    ///
    /// usbfs URBs carry no timeout; `timeout` is recorded on the `Transfer`
    /// only. Use `cancel_transfer` to give up on a request.
    pub fn submit_bulk(
        &self,
        endpoint: u8,
        length: u32,
        timeout: u32,
        buffer: Vec<u8>,
        completion: Option<CompletionSender>,
    ) -> Result<RequestId> {
        check_bounds(length as usize, buffer.len())?;
        self.ensure_open()?;
        let buffer_length = c_int::try_from(length).map_err(|_| Error::LengthOverflow {
            length: length as usize,
        })?;

        let id = self.shared.table.allocate_id();
        let entry = InFlight::bulk(id, endpoint, buffer_length, timeout, buffer, completion);
        let urb = entry.urb_ptr();

        // Registered before submission so a fast completion always finds it
        self.shared.table.insert(id, entry)?;

        // SAFETY: the URB and its buffer are owned by the table entry, which
        // is dropped only after the reaper dispatches its completion or the
        // descriptor has been closed
        if let Err(errno) = unsafe { self.backend.submit_urb(urb.as_ptr()) } {
            // Never reached the kernel, so the entry can be freed. It may
            // already have been abandoned by a terminating reaper.
            drop(self.shared.table.remove(id));
            warn!("Submitting {} on ep {:#04x} failed: {}", id, endpoint, errno);
            return Err(Error::kernel("submit URB", errno));
        }

        debug!(
            "Submitted {} on ep {:#04x}: length={}, timeout={}ms",
            id, endpoint, length, timeout
        );
        Ok(id)
    }

    /// Submit an asynchronous bulk transfer and wait for its completion
    pub async fn bulk_transfer_async(
        &self,
        endpoint: u8,
        length: u32,
        timeout: u32,
        buffer: Vec<u8>,
    ) -> Result<Transfer> {
        let (tx, rx) = oneshot::channel();
        let id = self.submit_bulk(endpoint, length, timeout, buffer, Some(tx))?;

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Cancelled { key: id }),
        }
    }

    /// Ask the kernel to cancel an in-flight asynchronous transfer
    ///
    /// The transfer is still reaped and delivered, typically with status
    /// `-ENOENT`.
    pub fn cancel_transfer(&self, id: RequestId) -> Result<()> {
        self.ensure_open()?;

        // The table lock is held across DISCARDURB so the URB cannot be
        // reaped and its address reused by another submission meanwhile
        let result = self
            .shared
            .table
            .with_entry(id, |entry| {
                // SAFETY: the address belongs to a URB submitted on this
                // backend and still owned by the table
                unsafe { self.backend.discard_urb(entry.urb_ptr().as_ptr()) }
            })
            .ok_or(Error::UnknownTransfer { key: id })?;

        result.map_err(|e| Error::kernel("discard URB", e))?;
        debug!("Discard requested for {}", id);
        Ok(())
    }

    /// Number of submitted transfers not yet reaped
    pub fn pending_count(&self) -> usize {
        self.shared.table.len()
    }

    pub fn is_pending(&self, id: RequestId) -> bool {
        self.shared.table.contains(id)
    }

    /// Watch the reaper's lifecycle
    ///
    /// Changes to `Terminated` when the kernel wait fails, which is how
    /// callers learn that no further completions will arrive.
    pub fn reaper_state(&self) -> watch::Receiver<ReaperState> {
        self.shared.state.subscribe()
    }

    pub fn stats(&self) -> ReaperStats {
        self.shared.stats()
    }
}

impl Drop for UsbDevice {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.close() {
                warn!("Error closing USB device on drop: {}", e);
            }
        }
    }
}

fn check_bounds(requested: usize, capacity: usize) -> Result<()> {
    if requested > capacity {
        return Err(Error::BufferTooSmall {
            requested,
            capacity,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{KernelCall, MockKernel};
    use std::time::Duration;
    use usbdevfs::Errno;

    fn open_mock() -> (Arc<MockKernel>, UsbDevice) {
        let kernel = Arc::new(MockKernel::new());
        let config = EngineConfig::default().with_poll_interval(Duration::from_millis(5));
        let device = UsbDevice::with_backend(kernel.clone(), config).unwrap();
        (kernel, device)
    }

    #[test]
    fn test_check_bounds() {
        assert!(check_bounds(64, 64).is_ok());
        assert!(check_bounds(0, 0).is_ok());
        assert_eq!(
            check_bounds(65, 64),
            Err(Error::BufferTooSmall {
                requested: 65,
                capacity: 64
            })
        );
    }

    #[test]
    fn test_open_missing_node() {
        let err = UsbDevice::open("/dev/bus/usb/999/999").err().unwrap();
        assert!(matches!(err, Error::DeviceUnavailable { .. }));
    }

    #[test]
    fn test_configuration_calls_reach_kernel() {
        let (kernel, device) = open_mock();

        device.claim_interface(1).unwrap();
        device.set_configuration(2).unwrap();
        device.set_interface(1, 3).unwrap();
        device.clear_halt(0x81).unwrap();
        device.release_interface(1).unwrap();
        device.reset().unwrap();

        assert_eq!(
            kernel.calls(),
            vec![
                KernelCall::ClaimInterface(1),
                KernelCall::SetConfiguration(2),
                KernelCall::SetInterface {
                    interface: 1,
                    alt_setting: 3
                },
                KernelCall::ClearHalt(0x81),
                KernelCall::ReleaseInterface(1),
                KernelCall::Reset,
            ]
        );
    }

    #[test]
    fn test_driver_commands_use_generic_ioctl() {
        let (kernel, device) = open_mock();

        device.disconnect_driver(0).unwrap();
        device.connect_driver(0).unwrap();

        assert_eq!(
            kernel.calls(),
            vec![
                KernelCall::DriverIoctl {
                    interface: 0,
                    command: codes::DISCONNECT
                },
                KernelCall::DriverIoctl {
                    interface: 0,
                    command: codes::CONNECT
                },
            ]
        );
    }

    #[test]
    fn test_kernel_error_is_passed_through() {
        let (kernel, device) = open_mock();
        kernel.fail_next(Errno::EBUSY);

        let err = device.claim_interface(0).unwrap_err();
        assert_eq!(
            err,
            Error::KernelRequestFailed {
                operation: "claim interface",
                errno: Errno::EBUSY
            }
        );
    }

    #[test]
    fn test_operations_after_close() {
        let (kernel, mut device) = open_mock();
        device.close().unwrap();
        let calls_after_close = kernel.call_count();

        assert_eq!(device.claim_interface(0), Err(Error::NotOpen));
        assert_eq!(
            device.submit_bulk(0x81, 8, 0, vec![0; 8], None),
            Err(Error::NotOpen)
        );
        assert_eq!(device.cancel_transfer(RequestId(1)), Err(Error::NotOpen));
        assert_eq!(kernel.call_count(), calls_after_close);
    }

    #[test]
    fn test_cancel_unknown_transfer() {
        let (_kernel, device) = open_mock();
        assert_eq!(
            device.cancel_transfer(RequestId(42)),
            Err(Error::UnknownTransfer { key: RequestId(42) })
        );
    }

    #[test]
    fn test_drop_closes_backend() {
        let (kernel, device) = open_mock();
        drop(device);
        assert_eq!(kernel.calls(), vec![KernelCall::Close]);
    }
}
