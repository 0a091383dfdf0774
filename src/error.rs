//! Server-level error types.
//!
//! Errors here are the ones that abort startup or surface from the control
//! thread. Per-connection I/O failures never appear in this module: they are
//! `io::Error`s handled by the owning worker and are fatal to that
//! connection only.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors raised while setting up or running the server.
///
/// Everything in this enum is fatal to the whole server: callers of
/// [`Server::run`](crate::server::Server::run) are expected to propagate it
/// and terminate.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("failed to listen on {addr}: {source}")]
    Listen { addr: SocketAddr, source: io::Error },

    #[error("failed to create poller: {source}")]
    PollCreate { source: io::Error },

    #[error("failed to register descriptor with poller: {source}")]
    Register { source: io::Error },

    #[error("invalid tls configuration: {reason}")]
    TlsSetup { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ServerError {
    pub fn bind(addr: SocketAddr, source: io::Error) -> Self {
        Self::Bind { addr, source }
    }

    pub fn listen(addr: SocketAddr, source: io::Error) -> Self {
        Self::Listen { addr, source }
    }

    pub fn tls_setup<S: ToString>(reason: S) -> Self {
        Self::TlsSetup { reason: reason.to_string() }
    }

    pub fn register(source: io::Error) -> Self {
        Self::Register { source }
    }
}
