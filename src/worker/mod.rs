//! Worker pool and per-worker task loop.
//!
//! A fixed set of worker threads each owns a task queue and a private table
//! of live connections. All events for one connection are serialized
//! through the worker recorded in the [`AffinityMap`] at accept time, so a
//! connection's buffers are never touched by two threads concurrently.
//!
//! Workers suspend only inside the queue pop (1 s timeout so the stop flag
//! is observed); a picked-up task runs its read/write loop to completion
//! without suspending: synchronous-nonblocking, never cooperative.

mod affinity;

pub use affinity::AffinityMap;

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use mio::{Interest, Registry, Token};
use tracing::{debug, error, trace, warn};

use crate::connection::Connection;
use crate::error::ServerError;
use crate::handler::{ConnectionHandler, ConnectionIo};
use crate::transport::{ReadOutcome, WriteOutcome};

/// How long a worker blocks on its queue before re-checking the stop flag.
/// Shutdown latency is bounded by this plus any in-flight drain.
const POP_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection tokens are the raw descriptor value.
pub(crate) fn fd_token(fd: RawFd) -> Token {
    Token(fd as usize)
}

/// One unit of work bound to a connection identity.
#[derive(Debug)]
pub(crate) enum WorkerTask {
    /// Ownership handoff from the event loop right after accept. Queued
    /// before any readiness task for the same descriptor can exist, so a
    /// worker never sees an event for a connection it does not yet own.
    Register(Connection),
    Readable(RawFd),
    Writable(RawFd),
    ErrorOrHangup(RawFd),
}

/// Fixed-size pool of worker threads with round-robin assignment.
pub(crate) struct WorkerPool {
    senders: Vec<Sender<WorkerTask>>,
    threads: Vec<JoinHandle<()>>,
    next: AtomicUsize,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawns `size` workers, each with a cloned poller registry so it can
    /// deregister descriptors it tears down.
    pub(crate) fn spawn<H: ConnectionHandler>(
        size: usize,
        registry: &Registry,
        affinity: Arc<AffinityMap>,
        handler: Arc<H>,
    ) -> Result<Self, ServerError> {
        let size = size.max(1);
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut senders = Vec::with_capacity(size);
        let mut threads = Vec::with_capacity(size);

        for index in 0..size {
            let (tx, rx) = crossbeam_channel::unbounded();
            let worker = Worker {
                index,
                queue: rx,
                registry: registry.try_clone()?,
                affinity: Arc::clone(&affinity),
                handler: Arc::clone(&handler),
                connections: HashMap::new(),
                shutdown: Arc::clone(&shutdown),
            };
            let thread = std::thread::Builder::new()
                .name(format!("mtcp-worker-{index}"))
                .spawn(move || worker.run())?;
            senders.push(tx);
            threads.push(thread);
        }

        Ok(Self { senders, threads, next: AtomicUsize::new(0), shutdown })
    }

    pub(crate) fn size(&self) -> usize {
        self.senders.len()
    }

    /// Next worker index, round-robin. Called by the event loop on first
    /// sight of a descriptor.
    pub(crate) fn next_index(&self) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len()
    }

    pub(crate) fn dispatch(&self, index: usize, task: WorkerTask) {
        if self.senders[index].send(task).is_err() {
            warn!(worker = index, "task dropped, worker queue is gone");
        }
    }

    /// Requests stop and joins every worker. Latency is bounded by
    /// [`POP_TIMEOUT`] plus any in-flight drain.
    pub(crate) fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        // Dropping the senders unblocks idle queue pops right away; the
        // flag covers a worker that is mid-task when they drain.
        self.senders.clear();
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Worker-thread state: queue consumer plus the private connection table.
struct Worker<H> {
    index: usize,
    queue: Receiver<WorkerTask>,
    registry: Registry,
    affinity: Arc<AffinityMap>,
    handler: Arc<H>,
    connections: HashMap<RawFd, Connection>,
    shutdown: Arc<AtomicBool>,
}

impl<H: ConnectionHandler> Worker<H> {
    fn run(mut self) {
        debug!(worker = self.index, "worker started");
        loop {
            match self.queue.recv_timeout(POP_TIMEOUT) {
                Ok(task) => self.dispatch(task),
                Err(RecvTimeoutError::Timeout) => {
                    if self.shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let fds: Vec<RawFd> = self.connections.keys().copied().collect();
        for fd in fds {
            self.close_connection(fd);
        }
        debug!(worker = self.index, "worker stopped");
    }

    fn dispatch(&mut self, task: WorkerTask) {
        match task {
            WorkerTask::Register(conn) => self.register(conn),
            WorkerTask::Readable(fd) => {
                if self.check_fd(fd) {
                    self.handle_readable(fd);
                }
            }
            WorkerTask::Writable(fd) => {
                if self.check_fd(fd) {
                    self.handle_writable(fd);
                }
            }
            WorkerTask::ErrorOrHangup(fd) => {
                if self.check_fd(fd) {
                    debug!(worker = self.index, fd, "hangup or error event, closing connection");
                    self.close_connection(fd);
                }
            }
        }
    }

    fn register(&mut self, conn: Connection) {
        let fd = conn.fd();
        let peer = conn.peer_addr();
        debug!(worker = self.index, fd, %peer, "connection registered");
        self.handler.on_connect(peer);
        self.connections.insert(fd, conn);
    }

    /// Descriptor values are reused by the OS after close: a queued task can
    /// outlive its connection, or even name a new connection owned by
    /// another worker. Such stale tasks are silently dropped.
    fn check_fd(&self, fd: RawFd) -> bool {
        self.affinity.lookup(fd).is_some() && self.connections.contains_key(&fd)
    }

    fn handle_readable(&mut self, fd: RawFd) {
        loop {
            let Some(conn) = self.connections.get_mut(&fd) else { return };

            let outcome = match conn.transport.read(&mut conn.input) {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(worker = self.index, fd, cause = %e, "read error, closing connection");
                    self.close_connection(fd);
                    return;
                }
            };

            match outcome {
                ReadOutcome::Data(n) => trace!(worker = self.index, fd, n, "bytes buffered"),
                ReadOutcome::BufferFull(n) => trace!(worker = self.index, fd, n, "bytes buffered, input at cap"),
                ReadOutcome::WouldBlock => {}
                ReadOutcome::Closed(n) => debug!(worker = self.index, fd, trailing = n, "peer closed connection"),
            }

            // Surface buffered bytes (including any that arrived just before
            // EOF) to the framing collaborator, then flush what it queued.
            if !self.deliver(fd) {
                return;
            }

            match outcome {
                ReadOutcome::Closed(_) => {
                    self.close_connection(fd);
                    return;
                }
                ReadOutcome::BufferFull(_) => {
                    // The handler just ran; a still-full buffer means one
                    // unconsumed message larger than the cap.
                    if self.connections.get(&fd).is_some_and(|c| c.input.is_saturated()) {
                        warn!(worker = self.index, fd, "input buffer saturated at cap, dropping connection");
                        self.close_connection(fd);
                        return;
                    }
                    // Room was reclaimed. Bytes left behind at the cap will
                    // never produce another edge report, so read them now.
                }
                ReadOutcome::Data(_) | ReadOutcome::WouldBlock => break,
            }
        }
        self.update_interest(fd);
    }

    fn handle_writable(&mut self, fd: RawFd) {
        // Transport-internal bytes (tls handshake output) go first.
        if let Some(conn) = self.connections.get_mut(&fd) {
            if let Err(e) = conn.transport.flush() {
                error!(worker = self.index, fd, cause = %e, "flush error, closing connection");
                self.close_connection(fd);
                return;
            }
        }
        if !self.flush_pending(fd) {
            return;
        }
        self.update_interest(fd);
    }

    /// Invokes the handler if unread bytes are buffered, then flushes any
    /// output it queued. Returns false when the connection was closed.
    fn deliver(&mut self, fd: RawFd) -> bool {
        if let Some(conn) = self.connections.get_mut(&fd) {
            if !conn.input.is_empty() {
                let handler = Arc::clone(&self.handler);
                let mut io = ConnectionIo::new(conn);
                handler.on_data(&mut io);
            }
        }
        self.flush_pending(fd)
    }

    /// Writes queued output buffers until done or the transport would
    /// block. Returns false when a write error closed the connection.
    fn flush_pending(&mut self, fd: RawFd) -> bool {
        let Some(conn) = self.connections.get_mut(&fd) else { return false };

        let mut failed = false;
        while let Some(front) = conn.pending.front_mut() {
            match conn.transport.write(front) {
                Ok(WriteOutcome::Flushed) => {
                    trace!(worker = self.index, fd, n = front.len(), "output buffer flushed");
                    conn.pending.pop_front();
                }
                Ok(WriteOutcome::Pending) => break,
                Err(e) => {
                    error!(worker = self.index, fd, cause = %e, "write error, closing connection");
                    failed = true;
                    break;
                }
            }
        }

        if failed {
            self.close_connection(fd);
            return false;
        }
        true
    }

    /// Re-arms poller interest: READABLE always, WRITABLE only while output
    /// is pending (instead of busy-waiting on a blocked write).
    fn update_interest(&mut self, fd: RawFd) {
        let Some(conn) = self.connections.get_mut(&fd) else { return };

        let desired = if conn.has_pending_output() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };

        if desired == conn.interest {
            return;
        }

        match conn.transport.reregister(&self.registry, fd_token(fd), desired) {
            Ok(()) => conn.interest = desired,
            Err(e) => {
                error!(worker = self.index, fd, cause = %e, "can't update poller interest, closing connection");
                self.close_connection(fd);
            }
        }
    }

    /// Teardown, performed only by the owning worker: deregister from the
    /// poller, close the transport layer, remove the affinity entry, and
    /// only then drop the connection. Dropping closes the descriptor, and
    /// the OS may hand the same value to a freshly accepted connection
    /// right away; the entry must already be gone by then or this worker
    /// would delete the new connection's routing.
    fn close_connection(&mut self, fd: RawFd) {
        let Some(mut conn) = self.connections.remove(&fd) else { return };

        if let Err(e) = conn.transport.deregister(&self.registry) {
            debug!(worker = self.index, fd, cause = %e, "deregister failed during teardown");
        }
        conn.transport.shutdown();
        let peer = conn.peer_addr();
        self.affinity.remove(fd);
        drop(conn);

        self.handler.on_close(peer);
        debug!(worker = self.index, fd, %peer, "connection closed");
    }
}
