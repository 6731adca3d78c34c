//! Reaper thread
//!
//! Dedicated thread per device handle that drains completed URBs from the
//! kernel and delivers each one to the transfer that submitted it.
//!
//! Each iteration checks the shutdown channel without blocking, then waits on
//! the backend for at most the poll interval, so a stop request is observed
//! within one interval. There is no cap on how many completions are reaped.
//! A failed wait is fatal: every transfer still pending is failed with
//! `ReaperTerminated` and the handle's state watch switches to `Terminated`.

use crate::backend::{Completion, UsbBackend};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::pending::PendingTable;
use async_channel::{Receiver, Sender, TryRecvError, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use usbdevfs::Errno;

/// Lifecycle of a handle's reaper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaperState {
    /// Draining completions
    Running,
    /// Stopped by `close`
    Stopped,
    /// The kernel wait failed; pending transfers were failed with this errno
    Terminated { errno: Errno },
}

impl ReaperState {
    pub fn is_running(&self) -> bool {
        matches!(self, ReaperState::Running)
    }
}

/// Snapshot of reaper counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaperStats {
    /// Completions matched to a pending transfer
    pub reaped: u64,
    /// Completions whose key had no pending entry
    pub protocol_violations: u64,
}

#[derive(Default)]
struct Counters {
    reaped: AtomicU64,
    protocol_violations: AtomicU64,
}

/// State shared between a handle and its reaper
pub(crate) struct Shared {
    pub(crate) table: PendingTable,
    pub(crate) state: watch::Sender<ReaperState>,
    counters: Counters,
}

impl Shared {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(ReaperState::Running);
        Self {
            table: PendingTable::new(),
            state,
            counters: Counters::default(),
        }
    }

    pub(crate) fn stats(&self) -> ReaperStats {
        ReaperStats {
            reaped: self.counters.reaped.load(Ordering::Relaxed),
            protocol_violations: self.counters.protocol_violations.load(Ordering::Relaxed),
        }
    }
}

struct Reaper {
    backend: Arc<dyn UsbBackend>,
    shared: Arc<Shared>,
    shutdown: Receiver<()>,
    poll_interval: Duration,
}

impl Reaper {
    fn run(self) -> ReaperState {
        info!("USB reaper started");

        let exit = loop {
            match self.shutdown.try_recv() {
                Ok(()) | Err(TryRecvError::Closed) => {
                    debug!("USB reaper shutting down");
                    break ReaperState::Stopped;
                }
                Err(TryRecvError::Empty) => {}
            }

            match self.backend.reap(self.poll_interval) {
                Ok(Some(completion)) => self.dispatch(completion),
                Ok(None) => {}
                Err(errno) => {
                    error!("Waiting for URB completions failed: {}", errno);
                    self.terminate(errno);
                    break ReaperState::Terminated { errno };
                }
            }
        };

        self.shared.state.send_replace(exit);
        info!("USB reaper stopped: {:?}", exit);
        exit
    }

    fn dispatch(&self, completion: Completion) {
        let Some(entry) = self.shared.table.remove(completion.key) else {
            let violation = Error::ProtocolViolation {
                key: completion.key,
            };
            warn!("{} (status {})", violation, completion.status);
            self.shared
                .counters
                .protocol_violations
                .fetch_add(1, Ordering::Relaxed);
            return;
        };

        self.shared.counters.reaped.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Reaped {}: status={} actual_length={}",
            completion.key, completion.status, completion.actual_length
        );
        entry.deliver(completion.key, completion.status, completion.actual_length);
    }

    fn terminate(&self, errno: Errno) {
        let reason = Error::ReaperTerminated { errno };
        let abandoned = self
            .shared
            .table
            .abandon_all(reason.clone(), |_| reason.clone());
        if abandoned > 0 {
            warn!(
                "{} pending transfers failed after reaper termination",
                abandoned
            );
        }
    }
}

/// Owner's side of a running reaper thread
pub(crate) struct ReaperHandle {
    shutdown: Sender<()>,
    thread: JoinHandle<ReaperState>,
}

impl ReaperHandle {
    /// Spawn the reaper thread for a handle
    pub(crate) fn spawn(
        backend: Arc<dyn UsbBackend>,
        shared: Arc<Shared>,
        config: &EngineConfig,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = bounded(1);
        let reaper = Reaper {
            backend,
            shared,
            shutdown: shutdown_rx,
            poll_interval: config.poll_interval,
        };

        let thread = std::thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || reaper.run())
            .map_err(|e| Error::ReaperSpawn {
                reason: e.to_string(),
            })?;

        Ok(Self {
            shutdown: shutdown_tx,
            thread,
        })
    }

    /// Signal shutdown and wait for the thread to exit
    ///
    /// Returns within one poll interval unless a backend call blocks longer.
    pub(crate) fn stop(self) -> ReaperState {
        let _ = self.shutdown.try_send(());
        self.shutdown.close();

        match self.thread.join() {
            Ok(state) => state,
            Err(e) => {
                error!("USB reaper thread panicked: {:?}", e);
                ReaperState::Stopped
            }
        }
    }
}
