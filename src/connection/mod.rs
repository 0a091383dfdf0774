//! Per-connection state, owned by exactly one worker.
//!
//! The control thread hands a [`Connection`] to its assigned worker right
//! after accept and keeps only the descriptor value afterwards. From that
//! point the worker is the single owner: buffers need no locking and the
//! descriptor can only be closed once.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::fd::RawFd;

use mio::Interest;

use crate::buffer::{InputBuffer, OutputBuffer};
use crate::transport::Transport;

/// A live connection: its transport, receive buffer, queued outbound
/// messages and current poller interest.
pub struct Connection {
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) input: InputBuffer,
    pub(crate) pending: VecDeque<OutputBuffer>,
    pub(crate) interest: Interest,
    peer: SocketAddr,
    fd: RawFd,
}

impl Connection {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        let peer = transport.peer_addr();
        let fd = transport.raw_fd();
        Self {
            transport,
            input: InputBuffer::new(),
            pending: VecDeque::new(),
            interest: Interest::READABLE,
            peer,
            fd,
        }
    }

    /// Stable identity: the raw descriptor value, unique while open.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// True when outbound messages are still waiting on the transport.
    pub(crate) fn has_pending_output(&self) -> bool {
        !self.pending.is_empty() || self.transport.wants_write()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.fd)
            .field("peer", &self.peer)
            .field("buffered", &self.input.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}
