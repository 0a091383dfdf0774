//! Listening-socket setup.

use std::net::SocketAddr;

use mio::net::TcpListener;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use crate::error::ServerError;

/// Binds a non-blocking listener with an explicit backlog.
///
/// `mio`'s own bind hides the backlog, so the socket is built through
/// `socket2` and handed over once listening. Any failure here is fatal to
/// the whole server.
pub(crate) fn bind(addr: SocketAddr, backlog: u32) -> Result<TcpListener, ServerError> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(|e| ServerError::bind(addr, e))?;

    // Lets restarts rebind while old connections sit in TIME_WAIT.
    socket.set_reuse_address(true).map_err(|e| ServerError::bind(addr, e))?;
    socket.bind(&addr.into()).map_err(|e| ServerError::bind(addr, e))?;
    socket.listen(backlog as i32).map_err(|e| ServerError::listen(addr, e))?;
    socket.set_nonblocking(true).map_err(|e| ServerError::listen(addr, e))?;

    let listener = TcpListener::from_std(socket.into());
    debug!(%addr, backlog, "listener bound");
    Ok(listener)
}
