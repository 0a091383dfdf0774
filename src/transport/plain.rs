//! Plain (non-TLS) TCP transport.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::trace;

use crate::buffer::{InputBuffer, OutputBuffer};

use super::{ReadOutcome, Transport, WriteOutcome};

/// A bare non-blocking TCP stream.
#[derive(Debug)]
pub struct PlainSocket {
    stream: TcpStream,
    peer: SocketAddr,
}

impl PlainSocket {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self { stream, peer }
    }
}

impl Transport for PlainSocket {
    fn read(&mut self, buf: &mut InputBuffer) -> io::Result<ReadOutcome> {
        let mut nbytes = 0;
        loop {
            let tail = buf.writable_tail();
            if tail.is_empty() {
                // Saturated at the cap; whatever the kernel still holds
                // stays there until the caller reclaims room and re-reads.
                return Ok(ReadOutcome::BufferFull(nbytes));
            }
            match self.stream.read(tail) {
                Ok(0) => return Ok(ReadOutcome::Closed(nbytes)),
                Ok(n) => {
                    trace!(fd = self.raw_fd(), n, "read bytes from socket");
                    buf.advance(n);
                    nbytes += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return if nbytes == 0 { Ok(ReadOutcome::WouldBlock) } else { Ok(ReadOutcome::Data(nbytes)) };
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn write(&mut self, buf: &mut OutputBuffer) -> io::Result<WriteOutcome> {
        while !buf.finished() {
            match self.stream.write(buf.remaining()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    trace!(fd = self.raw_fd(), n, "wrote bytes to socket");
                    buf.advance(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(WriteOutcome::Pending),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(WriteOutcome::Flushed)
    }

    fn flush(&mut self) -> io::Result<WriteOutcome> {
        Ok(WriteOutcome::Flushed)
    }

    fn wants_write(&self) -> bool {
        false
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
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
