//! Pending table
//!
//! Maps each in-flight request's key to the entry that owns its URB and
//! buffer. A key is present from just before `SUBMITURB` until the reaper
//! removes it, so the table size always equals submitted minus reaped.
//!
//! The mutex guards only table operations; it is never held across a
//! blocking kernel wait.

use crate::error::{Error, Result};
use crate::transfer::InFlight;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;
use usbdevfs::RequestId;

#[derive(Default)]
struct TableInner {
    entries: HashMap<RequestId, InFlight>,
    /// Set once the table stops accepting entries
    closed: Option<Error>,
    /// Entries whose waiters were failed but whose memory the kernel may
    /// still reference; freed once the descriptor is closed
    orphans: Vec<InFlight>,
}

pub(crate) struct PendingTable {
    inner: Mutex<TableInner>,
    next_id: AtomicU64,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next correlation key; never reused for the lifetime of the table
    pub(crate) fn allocate_id(&self) -> RequestId {
        RequestId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register an entry ahead of submission
    ///
    /// Fails with the closing error once `abandon_all` has run.
    pub(crate) fn insert(&self, id: RequestId, entry: InFlight) -> Result<()> {
        let mut inner = self.lock();
        if let Some(err) = &inner.closed {
            return Err(err.clone());
        }
        let previous = inner.entries.insert(id, entry);
        debug_assert!(previous.is_none(), "duplicate request key {}", id);
        Ok(())
    }

    pub(crate) fn remove(&self, id: RequestId) -> Option<InFlight> {
        self.lock().entries.remove(&id)
    }

    /// Run `f` on the entry for `id` while holding the table lock
    pub(crate) fn with_entry<T>(&self, id: RequestId, f: impl FnOnce(&InFlight) -> T) -> Option<T> {
        self.lock().entries.get(&id).map(f)
    }

    pub(crate) fn contains(&self, id: RequestId) -> bool {
        self.lock().entries.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[cfg(test)]
    pub(crate) fn closed_error(&self) -> Option<Error> {
        self.lock().closed.clone()
    }

    /// Stop accepting entries and fail every outstanding waiter
    ///
    /// Later inserts fail with `closing`; each waiter receives
    /// `make_error(key)`. Entries are moved to the orphan list rather than
    /// dropped: the kernel may still write to their URBs until the descriptor
    /// is closed. The first closing error sticks. Returns the number of
    /// entries abandoned.
    pub(crate) fn abandon_all(
        &self,
        closing: Error,
        make_error: impl Fn(RequestId) -> Error,
    ) -> usize {
        let drained: Vec<(RequestId, InFlight)> = {
            let mut inner = self.lock();
            inner.closed.get_or_insert(closing);
            inner.entries.drain().collect()
        };

        let count = drained.len();
        let mut orphans = Vec::with_capacity(count);
        for (id, mut entry) in drained {
            entry.fail(make_error(id));
            orphans.push(entry);
        }

        if count > 0 {
            debug!("Abandoned {} pending transfers", count);
            self.lock().orphans.extend(orphans);
        }
        count
    }

    /// Free abandoned entries; only valid once the kernel has released them
    pub(crate) fn release_orphans(&self) -> usize {
        let orphans = std::mem::take(&mut self.lock().orphans);
        orphans.len()
    }
}
