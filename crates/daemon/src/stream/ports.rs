//! Camera port allocation.
//!
//! Every live stream session owns one port from a fixed inclusive range.
//! The pool is the only mutable state shared across sessions, so every
//! operation takes the inner lock once and completes without awaiting.

use std::collections::BTreeSet;
use std::sync::Mutex;

use thiserror::Error;

/// Errors returned by the port pool.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    /// Every port in the range is in use.
    #[error("no free port in range {start}..={end}")]
    Exhausted { start: u16, end: u16 },

    /// The port was not allocated from this pool.
    #[error("port {0} is not allocated")]
    NotAllocated(u16),
}

/// Hands out unique ports from a bounded range.
#[derive(Debug)]
pub struct PortPool {
    start: u16,
    end: u16,
    allocated: Mutex<BTreeSet<u16>>,
}

impl PortPool {
    /// Creates a pool over `start..=end`.
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            allocated: Mutex::new(BTreeSet::new()),
        }
    }

    /// Allocates the lowest free port.
    pub fn allocate(&self) -> Result<u16, PortError> {
        let mut allocated = self.lock();
        let port = (self.start..=self.end)
            .find(|p| !allocated.contains(p))
            .ok_or(PortError::Exhausted {
                start: self.start,
                end: self.end,
            })?;
        allocated.insert(port);
        tracing::debug!(port, in_use = allocated.len(), "Allocated camera port");
        Ok(port)
    }

    /// Allocates the lowest free port that is not in `skip`.
    ///
    /// Used when a port turned out to be held by another process.
    pub fn allocate_excluding(&self, skip: &[u16]) -> Result<u16, PortError> {
        let mut allocated = self.lock();
        let port = (self.start..=self.end)
            .find(|p| !allocated.contains(p) && !skip.contains(p))
            .ok_or(PortError::Exhausted {
                start: self.start,
                end: self.end,
            })?;
        allocated.insert(port);
        Ok(port)
    }

    /// Returns a port to the pool.
    pub fn release(&self, port: u16) -> Result<(), PortError> {
        let mut allocated = self.lock();
        if allocated.remove(&port) {
            tracing::debug!(port, in_use = allocated.len(), "Released camera port");
            Ok(())
        } else {
            Err(PortError::NotAllocated(port))
        }
    }

    /// Returns true if the port is currently allocated.
    pub fn is_allocated(&self, port: u16) -> bool {
        self.lock().contains(&port)
    }

    /// Number of ports currently in use.
    pub fn in_use(&self) -> usize {
        self.lock().len()
    }

    /// Total number of ports in the range. Zero for an inverted range.
    pub fn capacity(&self) -> usize {
        if self.end < self.start {
            return 0;
        }
        usize::from(self.end - self.start) + 1
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<u16>> {
        // The set is always left consistent, so a poisoned lock is still usable.
        self.allocated
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
