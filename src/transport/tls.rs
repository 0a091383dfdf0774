//! TLS transport: a rustls server session decorating a plain TCP stream.
//!
//! The handshake is never looped synchronously. A freshly accepted
//! connection starts in the session's handshaking state and every
//! readable/writable readiness event advances it through [`TlsSocket::read`]
//! / [`TlsSocket::flush`]; plaintext only surfaces once the handshake has
//! completed. A handshake failure is fatal to that connection attempt only;
//! the listener and all other connections are unaffected.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use rustls::ServerConnection;
use tracing::{debug, trace};

use crate::buffer::{InputBuffer, OutputBuffer};
use crate::error::ServerError;

use super::{ReadOutcome, Transport, WriteOutcome};

/// Loads a PEM certificate chain and private key into a shared rustls
/// server context. Called once at startup; failures abort startup.
pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<Arc<rustls::ServerConfig>, ServerError> {
    let cert_file = File::open(cert_path)
        .map_err(|e| ServerError::tls_setup(format!("can't open certificate {}: {e}", cert_path.display())))?;
    let cert_chain = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::tls_setup(format!("can't parse certificate {}: {e}", cert_path.display())))?;
    if cert_chain.is_empty() {
        return Err(ServerError::tls_setup(format!("no certificate found in {}", cert_path.display())));
    }

    let key_file = File::open(key_path)
        .map_err(|e| ServerError::tls_setup(format!("can't open private key {}: {e}", key_path.display())))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| ServerError::tls_setup(format!("can't parse private key {}: {e}", key_path.display())))?
        .ok_or_else(|| ServerError::tls_setup(format!("no private key found in {}", key_path.display())))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| ServerError::tls_setup(format!("invalid certificate/key pair: {e}")))?;
    Ok(Arc::new(config))
}

/// A TLS session layered over a non-blocking TCP stream.
pub struct TlsSocket {
    stream: TcpStream,
    session: ServerConnection,
    peer: SocketAddr,
}

impl TlsSocket {
    pub fn new(stream: TcpStream, session: ServerConnection, peer: SocketAddr) -> Self {
        Self { stream, session, peer }
    }

    /// Writes session-queued TLS records (handshake flights, alerts,
    /// encrypted application data) until drained or the socket would block.
    fn write_session_bytes(&mut self) -> io::Result<WriteOutcome> {
        while self.session.wants_write() {
            match self.session.write_tls(&mut self.stream) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(WriteOutcome::Pending),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(WriteOutcome::Flushed)
    }

    /// Moves decrypted application bytes out of the session into `buf`.
    fn drain_plaintext(&mut self, buf: &mut InputBuffer) -> io::Result<usize> {
        let mut nbytes = 0;
        loop {
            let tail = buf.writable_tail();
            if tail.is_empty() {
                // Saturated buffer; plaintext stays queued in the session.
                break;
            }
            match self.session.reader().read(tail) {
                // Clean TLS closure; surfaced through peer_has_closed
                Ok(0) => break,
                Ok(n) => {
                    buf.advance(n);
                    nbytes += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(nbytes)
    }
}

impl Transport for TlsSocket {
    fn read(&mut self, buf: &mut InputBuffer) -> io::Result<ReadOutcome> {
        let was_handshaking = self.session.is_handshaking();
        // Plaintext can be left queued in the session by a read that hit
        // the buffer cap; it must go out before new records are pulled.
        let mut nbytes = self.drain_plaintext(buf)?;
        if buf.is_saturated() {
            return Ok(ReadOutcome::BufferFull(nbytes));
        }
        loop {
            // Handshake responses queued by a previous iteration go out
            // before reading more; leftover bytes re-arm via wants_write.
            self.write_session_bytes()?;

            match self.session.read_tls(&mut self.stream) {
                Ok(0) => {
                    nbytes += self.drain_plaintext(buf)?;
                    debug!(fd = self.raw_fd(), peer = %self.peer, "tls peer closed the tcp stream");
                    return Ok(ReadOutcome::Closed(nbytes));
                }
                Ok(n) => trace!(fd = self.raw_fd(), n, "read tls records"),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            let state = match self.session.process_new_packets() {
                Ok(state) => state,
                Err(e) => {
                    // Best-effort alert delivery before the connection drops.
                    let _ = self.session.write_tls(&mut self.stream);
                    return Err(io::Error::new(io::ErrorKind::InvalidData, e));
                }
            };

            nbytes += self.drain_plaintext(buf)?;

            if state.peer_has_closed() {
                debug!(fd = self.raw_fd(), peer = %self.peer, "tls session closed by peer");
                return Ok(ReadOutcome::Closed(nbytes));
            }
            if buf.is_saturated() {
                // Undrained plaintext stays queued in the session until the
                // caller reclaims room and re-reads.
                return Ok(ReadOutcome::BufferFull(nbytes));
            }
        }

        if was_handshaking && !self.session.is_handshaking() {
            debug!(fd = self.raw_fd(), peer = %self.peer, "tls handshake completed");
        }

        if nbytes == 0 { Ok(ReadOutcome::WouldBlock) } else { Ok(ReadOutcome::Data(nbytes)) }
    }

    fn write(&mut self, buf: &mut OutputBuffer) -> io::Result<WriteOutcome> {
        loop {
            // Feed plaintext into the session until its internal buffer
            // stops accepting, then flush records to the socket.
            let mut fed = 0;
            while !buf.finished() {
                let n = self.session.writer().write(buf.remaining())?;
                if n == 0 {
                    break;
                }
                buf.advance(n);
                fed += n;
            }

            match self.write_session_bytes()? {
                WriteOutcome::Pending => return Ok(WriteOutcome::Pending),
                WriteOutcome::Flushed => {
                    if buf.finished() {
                        return Ok(WriteOutcome::Flushed);
                    }
                    if fed == 0 {
                        // No plaintext accepted and nothing left to flush;
                        // wait for the next writable event.
                        return Ok(WriteOutcome::Pending);
                    }
                }
            }
        }
    }

    fn flush(&mut self) -> io::Result<WriteOutcome> {
        self.write_session_bytes()
    }

    fn wants_write(&self) -> bool {
        self.session.wants_write()
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        registry.register(&mut self.stream, token, interest)
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        registry.reregister(&mut self.stream, token, interest)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }

    fn shutdown(&mut self) {
        self.session.send_close_notify();
        let _ = self.write_session_bytes();
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl std::fmt::Debug for TlsSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSocket")
            .field("fd", &self.raw_fd())
            .field("peer", &self.peer)
            .field("handshaking", &self.session.is_handshaking())
            .finish()
    }
}
