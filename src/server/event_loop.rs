//! Accept/event loop: the single control thread.
//!
//! The control thread owns the listening socket, the poller and the waker.
//! It accepts new connections, assigns round-robin worker affinity, hands
//! each accepted connection to its owner exactly once and fans readiness
//! events out as tasks; it never reads, writes or closes a connection
//! descriptor itself, so a worker mid-read can never race it on teardown.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, info, trace, warn};

use crate::connection::Connection;
use crate::error::ServerError;
use crate::handler::ConnectionHandler;
use crate::transport::{Acceptor, load_tls_config};
use crate::worker::{AffinityMap, WorkerPool, WorkerTask, fd_token};

use super::config::ServerConfig;
use super::listener;

/// Events drained per poll iteration.
const MAX_EVENTS: usize = 100;

/// Reserved token for the listening socket.
const LISTENER: Token = Token(usize::MAX - 1);

/// Reserved token for shutdown wakeups.
const WAKER: Token = Token(usize::MAX - 2);

/// The transport-and-concurrency engine: listener, poller and worker pool.
///
/// Construct with a [`ServerConfig`] and a [`ConnectionHandler`], then
/// either [`run`](Self::run) on the current thread or
/// [`start`](Self::start) a control thread and keep the returned
/// [`ServerHandle`] for shutdown.
pub struct Server<H> {
    config: ServerConfig,
    handler: Arc<H>,
}

impl<H: ConnectionHandler> Server<H> {
    pub fn new(config: ServerConfig, handler: H) -> Self {
        Self { config, handler: Arc::new(handler) }
    }

    /// Runs the accept/event loop on the calling thread. Setup errors
    /// propagate; the loop itself only ends at process shutdown.
    pub fn run(self) -> Result<(), ServerError> {
        let (event_loop, _waker, _addr) = self.build()?;
        event_loop.run()
    }

    /// Spawns the control thread and returns a handle carrying the bound
    /// address and the shutdown switch.
    pub fn start(self) -> Result<ServerHandle, ServerError> {
        let (event_loop, waker, local_addr) = self.build()?;
        let shutdown = Arc::clone(&event_loop.shutdown);
        let thread = std::thread::Builder::new()
            .name("mtcp-acceptor".to_string())
            .spawn(move || event_loop.run())?;
        Ok(ServerHandle { local_addr, shutdown, waker, thread: Some(thread) })
    }

    fn build(self) -> Result<(EventLoop, Arc<Waker>, SocketAddr), ServerError> {
        let tls = match self.config.tls() {
            Some(options) => Some(load_tls_config(&options.cert_path, &options.key_path)?),
            None => None,
        };
        let acceptor = Acceptor::new(tls);

        let mut listener = listener::bind(self.config.addr(), self.config.backlog())?;
        let local_addr = listener.local_addr()?;

        let poll = Poll::new().map_err(|e| ServerError::PollCreate { source: e })?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(ServerError::register)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER).map_err(|e| ServerError::PollCreate { source: e })?);

        let affinity = Arc::new(AffinityMap::new());
        let pool = WorkerPool::spawn(self.config.workers(), poll.registry(), Arc::clone(&affinity), self.handler)?;

        info!(addr = %local_addr, workers = pool.size(), tls = acceptor.is_tls(), "server listening");

        let event_loop = EventLoop {
            poll,
            listener,
            acceptor,
            affinity,
            pool,
            shutdown: Arc::new(AtomicBool::new(false)),
        };
        Ok((event_loop, waker, local_addr))
    }
}

impl<H> std::fmt::Debug for Server<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").field("config", &self.config).finish()
    }
}

/// Handle to a running server: bound address plus waker-based shutdown.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
    thread: Option<JoinHandle<Result<(), ServerError>>>,
}

impl ServerHandle {
    /// The actually bound listen address (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the server: wakes the control thread, which stops and joins
    /// the worker pool; workers close their remaining connections on exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else { return };
        self.shutdown.store(true, Ordering::Relaxed);
        if let Err(e) = self.waker.wake() {
            warn!(cause = %e, "can't wake control thread for shutdown");
        }
        match thread.join() {
            Ok(Ok(())) => info!("server stopped"),
            Ok(Err(e)) => error!(cause = %e, "server stopped with error"),
            Err(_) => error!("control thread panicked"),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Control-thread state.
struct EventLoop {
    poll: Poll,
    listener: TcpListener,
    acceptor: Acceptor,
    affinity: Arc<AffinityMap>,
    pool: WorkerPool,
    shutdown: Arc<AtomicBool>,
}

impl EventLoop {
    /// One iteration: block on the poller indefinitely, accept-all on
    /// listener readiness, fan connection readiness out to the owning
    /// workers. Ends when the shutdown flag is observed after a wakeup.
    fn run(mut self) -> Result<(), ServerError> {
        let mut events = Events::with_capacity(MAX_EVENTS);
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(cause = %e, "poll failed, shutting down");
                    self.pool.shutdown();
                    return Err(e.into());
                }
            }

            for event in events.iter() {
                match event.token() {
                    WAKER => {}
                    LISTENER => self.accept_all(),
                    token => self.dispatch_event(token, event),
                }
            }
        }

        debug!("control thread stopping");
        self.pool.shutdown();
        Ok(())
    }

    /// Accepts every currently pending connection. Per-connection failures
    /// are logged and skipped; the listener itself survives.
    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if e.kind() == io::ErrorKind::ConnectionAborted
                        || e.kind() == io::ErrorKind::ConnectionReset =>
                {
                    warn!(cause = %e, "transient accept error");
                }
                Err(e) => {
                    error!(cause = %e, "failed to accept client connection");
                    break;
                }
            }
        }
    }

    /// Wraps, registers and hands off one accepted stream. The affinity
    /// entry is created here, on first sight of the descriptor, before the
    /// connection travels to its worker, so every later event finds its
    /// owner.
    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        let mut transport = match self.acceptor.wrap(stream, peer) {
            Ok(transport) => transport,
            // wrap already logged the cause; the stream drops closed
            Err(_) => return,
        };

        let fd = transport.raw_fd();
        if let Err(e) = transport.register(self.poll.registry(), fd_token(fd), Interest::READABLE) {
            error!(fd, %peer, cause = %e, "can't register accepted connection with poller");
            return;
        }

        let index = self.pool.next_index();
        self.affinity.assign(fd, index);
        debug!(fd, %peer, worker = index, "accepted connection");
        self.pool.dispatch(index, WorkerTask::Register(Connection::new(transport)));
    }

    /// Routes a readiness event to the owning worker. A missing affinity
    /// entry means the connection was already torn down; the event is
    /// silently dropped.
    fn dispatch_event(&self, token: Token, event: &Event) {
        let fd = token.0 as RawFd;
        let Some(index) = self.affinity.lookup(fd) else {
            trace!(fd, "event for unknown descriptor, dropped");
            return;
        };

        let mut dispatched = false;
        if event.is_readable() {
            self.pool.dispatch(index, WorkerTask::Readable(fd));
            dispatched = true;
        }
        if event.is_writable() {
            self.pool.dispatch(index, WorkerTask::Writable(fd));
            dispatched = true;
        }
        // Hangup/error with no readable side goes straight to teardown;
        // with a readable side the worker's read observes it instead.
        if !dispatched && (event.is_error() || event.is_read_closed() || event.is_write_closed()) {
            self.pool.dispatch(index, WorkerTask::ErrorOrHangup(fd));
        }
    }
}
