//! Descriptor-to-worker affinity table.

use std::collections::HashMap;
use std::os::fd::RawFd;

use parking_lot::RwLock;

/// Concurrent table from descriptor value to owning worker index.
///
/// An entry exists iff the descriptor is currently registered with the
/// poller and owned by exactly one worker. The event loop only calls
/// [`lookup`](Self::lookup) and [`assign`](Self::assign); workers only call
/// `lookup` (descriptor values are reused by the OS, so a task must
/// re-validate its fd before touching anything) and
/// [`remove`](Self::remove) during teardown. Sized for many concurrent
/// lookups and rare mutations.
#[derive(Debug, Default)]
pub struct AffinityMap {
    map: RwLock<HashMap<RawFd, usize>>,
}

impl AffinityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, fd: RawFd) -> Option<usize> {
        self.map.read().get(&fd).copied()
    }

    /// Records the worker owning `fd`. Called exactly once per descriptor,
    /// by the event loop, at accept time.
    pub fn assign(&self, fd: RawFd, worker_index: usize) {
        self.map.write().insert(fd, worker_index);
    }

    /// Drops the entry for `fd`. Called exactly once per descriptor, by the
    /// owning worker, during connection teardown.
    pub fn remove(&self, fd: RawFd) {
        self.map.write().remove(&fd);
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}
