//! Socket transport abstraction.
//!
//! A [`Transport`] is the byte-stream capability a connection is built on:
//! non-blocking read into an [`InputBuffer`], non-blocking write out of an
//! [`OutputBuffer`], poller registration and graceful shutdown. Exactly two
//! implementations exist, selected once at accept time by the [`Acceptor`]:
//!
//! - [`PlainSocket`]: a bare TCP stream
//! - [`TlsSocket`]: a TLS session decorating a TCP stream
//!
//! Every I/O primitive distinguishes three outcomes: *no data ready*
//! (benign, never logged as an error), *orderly close*, and *hard error*
//! (fatal to the connection, never to the process). TLS adds a fourth,
//! *handshake incomplete*, which stays internal to [`TlsSocket`] and is
//! never surfaced as connection data.

mod plain;
mod tls;

pub use plain::PlainSocket;
pub use tls::{TlsSocket, load_tls_config};

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::error;

use crate::buffer::{InputBuffer, OutputBuffer};
use crate::error::ServerError;

/// Result of draining a transport into an [`InputBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n > 0` bytes were accumulated into the buffer this call.
    Data(usize),
    /// Nothing was available and nothing was accumulated.
    WouldBlock,
    /// The buffer hit its cap with `n` bytes accumulated this call; more
    /// bytes may still be waiting in the kernel or the TLS session. An
    /// edge-triggered poller will not report them again, so the caller
    /// must read again itself once room is reclaimed.
    BufferFull(usize),
    /// Orderly peer close, after `n` bytes were accumulated this call.
    /// Already-read bytes are never discarded.
    Closed(usize),
}

/// Result of flushing an [`OutputBuffer`] through a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The buffer finished and no session bytes remain queued.
    Flushed,
    /// The transport cannot accept more right now; the caller must re-arm
    /// writable interest and retry on the next readiness event.
    Pending,
}

/// Uniform accept/read/write/close capability over a raw descriptor or a
/// TLS session layered on one.
pub trait Transport: Send {
    /// Drains as many available bytes as possible into `buf`, looping the
    /// underlying read until it would block. See [`ReadOutcome`].
    fn read(&mut self, buf: &mut InputBuffer) -> io::Result<ReadOutcome>;

    /// Attempts to flush the unsent remainder of `buf`, advancing its
    /// offset by whatever the transport accepted.
    fn write(&mut self, buf: &mut OutputBuffer) -> io::Result<WriteOutcome>;

    /// Flushes transport-internal queued bytes (TLS handshake and record
    /// output). Plain sockets have none and always report `Flushed`.
    fn flush(&mut self) -> io::Result<WriteOutcome>;

    /// True while transport-internal bytes are queued for the peer and a
    /// writable-readiness event is needed to make progress.
    fn wants_write(&self) -> bool;

    /// Stable identity for poller registration and affinity lookup.
    fn raw_fd(&self) -> RawFd;

    fn peer_addr(&self) -> SocketAddr;

    fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()>;

    fn reregister(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()>;

    fn deregister(&mut self, registry: &Registry) -> io::Result<()>;

    /// Graceful close of the transport layer. For TLS this queues a
    /// close_notify and best-effort flushes it; the descriptor itself is
    /// closed when the transport is dropped.
    fn shutdown(&mut self);
}

/// Selects the transport wrapped around each accepted stream.
///
/// Constructed once at startup and owned by the event loop; holds the shared
/// TLS server context when TLS termination is enabled.
#[derive(Clone)]
pub enum Acceptor {
    Plain,
    Tls(Arc<rustls::ServerConfig>),
}

impl Acceptor {
    /// Builds an acceptor from an optional TLS context loaded via
    /// [`load_tls_config`].
    pub fn new(tls: Option<Arc<rustls::ServerConfig>>) -> Self {
        match tls {
            Some(config) => Self::Tls(config),
            None => Self::Plain,
        }
    }

    /// Wraps an accepted stream. For TLS the handshake is *not* driven
    /// here: the session starts in its handshaking state and advances on
    /// readiness events, so accept never blocks the control thread.
    pub fn wrap(&self, stream: TcpStream, peer: SocketAddr) -> Result<Box<dyn Transport>, ServerError> {
        match self {
            Self::Plain => Ok(Box::new(PlainSocket::new(stream, peer))),
            Self::Tls(config) => {
                let session = rustls::ServerConnection::new(Arc::clone(config)).map_err(|e| {
                    error!(%peer, cause = %e, "can't create tls session for accepted connection");
                    ServerError::tls_setup(e)
                })?;
                Ok(Box::new(TlsSocket::new(stream, session, peer)))
            }
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain => f.write_str("Acceptor::Plain"),
            Self::Tls(_) => f.write_str("Acceptor::Tls"),
        }
    }
}
