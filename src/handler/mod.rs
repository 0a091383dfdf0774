//! Downstream byte-delivery interface.
//!
//! The core's responsibility ends at "bytes available in this connection's
//! buffer". A [`ConnectionHandler`] is the message-framing collaborator that
//! consumes those bytes: it sees the unread span, takes what forms a
//! complete logical message via [`ConnectionIo::consume`], and queues
//! outbound payloads with [`ConnectionIo::send`]; the core drives them to
//! completion across writable-readiness events.
//!
//! Handlers are shared across all worker threads and invoked with the
//! connection exclusively borrowed, so per-connection state needs no
//! locking while handler-global state must be `Sync`.

use std::net::SocketAddr;
use std::os::fd::RawFd;

use bytes::Bytes;

use crate::buffer::OutputBuffer;
use crate::connection::Connection;

/// Handler for connection lifecycle and inbound bytes.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Called whenever unread bytes are available on a connection. The
    /// handler consumes zero or more of them; unconsumed bytes stay
    /// buffered and are presented again together with the next read.
    fn on_data(&self, io: &mut ConnectionIo<'_>);

    /// Called once when a connection has been accepted and handed to its
    /// worker.
    fn on_connect(&self, _peer: SocketAddr) {}

    /// Called exactly once when the connection is torn down, whatever the
    /// cause (orderly close, reset, hangup, saturation drop).
    fn on_close(&self, _peer: SocketAddr) {}
}

/// The worker-side view of one connection handed to [`ConnectionHandler::on_data`].
pub struct ConnectionIo<'a> {
    conn: &'a mut Connection,
}

impl<'a> ConnectionIo<'a> {
    pub(crate) fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    /// The current unread byte span, in arrival order.
    pub fn bytes(&self) -> &[u8] {
        self.conn.input.bytes()
    }

    /// Consumes the first `n` unread bytes; the remainder shifts to the
    /// front of the buffer.
    pub fn consume(&mut self, n: usize) {
        self.conn.input.consume(n);
    }

    /// Queues an outbound payload. The core flushes it as the transport
    /// accepts bytes, re-arming writable interest when it would block.
    pub fn send<B: Into<Bytes>>(&mut self, payload: B) {
        self.conn.pending.push_back(OutputBuffer::new(payload));
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.peer_addr()
    }

    pub fn fd(&self) -> RawFd {
        self.conn.fd()
    }
}

/// Adapter turning a plain closure into a [`ConnectionHandler`].
#[derive(Debug)]
pub struct HandlerFn<F> {
    f: F,
}

impl<F> ConnectionHandler for HandlerFn<F>
where
    F: Fn(&mut ConnectionIo<'_>) + Send + Sync + 'static,
{
    fn on_data(&self, io: &mut ConnectionIo<'_>) {
        (self.f)(io)
    }
}

pub fn make_handler<F>(f: F) -> HandlerFn<F>
where
    F: Fn(&mut ConnectionIo<'_>) + Send + Sync + 'static,
{
    HandlerFn { f }
}
