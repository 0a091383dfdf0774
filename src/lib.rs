//! An epoll-driven micro TCP server core
//!
//! This crate provides the transport and concurrency engine underneath an
//! HTTP(S) API server: a non-blocking accept/event loop, a socket
//! abstraction with pluggable TLS termination, growable per-connection
//! buffers and a sticky-affinity worker pool. It deliberately stops at
//! byte-stream delivery; message framing, routing and application logic
//! are collaborators layered on top through the [`handler`] interface.
//!
//! # Features
//!
//! - Single control thread owning the listener and the poller (epoll,
//!   through `mio`)
//! - Fixed worker-thread pool with sticky per-connection affinity: every
//!   event for a connection is handled by the same worker for its lifetime,
//!   so connection state needs no locking
//! - Growable input buffers (10 KiB initial, 1 MiB cap, compacting
//!   `consume`) and offset-tracked output buffers
//! - Plain TCP and TLS transports behind one trait; the TLS handshake is
//!   advanced by readiness events, never by spinning
//! - Write backpressure via writable-interest re-arming, never busy-waiting
//! - Per-connection failures are isolated: they drop that connection and
//!   nothing else
//!
//! # Example
//!
//! ```no_run
//! use micro_tcp::handler::{ConnectionIo, make_handler};
//! use micro_tcp::server::{Server, ServerConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::builder()
//!         .address("0.0.0.0:8080".parse()?)
//!         .workers(4)
//!         .build()?;
//!
//!     // Echo every complete chunk back to the peer.
//!     let handler = make_handler(|io: &mut ConnectionIo<'_>| {
//!         let n = io.bytes().len();
//!         let payload = io.bytes().to_vec();
//!         io.consume(n);
//!         io.send(payload);
//!     });
//!
//!     Server::new(config, handler).run()?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! The crate is organized into several key modules:
//!
//! - [`server`]: configuration, listener setup and the accept/event loop
//! - [`worker`]: the worker pool, per-worker task loop and affinity map
//! - [`transport`]: the socket abstraction (plain and TLS)
//! - [`connection`]: per-connection state owned by its worker
//! - [`buffer`]: the growable input / offset-tracked output buffer pair
//! - [`handler`]: the downstream byte-delivery interface
//!
//! Data flows in one direction: the event loop accepts a connection,
//! assigns it a worker (round-robin on first sight) and hands it over;
//! readiness events become tasks on that worker's queue; the worker drains
//! the transport into the connection's input buffer and surfaces the unread
//! span to the [`handler::ConnectionHandler`]; payloads the handler queues
//! are driven out across writable-readiness events until finished.
//!
//! # Concurrency model
//!
//! The control thread suspends only in the poller wait; workers suspend
//! only in their queue pop. Once picked up, a task runs its read/write
//! loop to completion; the I/O is synchronous-nonblocking, not
//! cooperative. The affinity map is the only structure written by more than
//! one thread class (the control thread assigns, the owning worker removes)
//! and sits behind a reader/writer lock; everything per-connection is owned
//! by exactly one worker.
//!
//! # Limitations
//!
//! - Unix only (epoll-class pollers via `mio`)
//! - No protocol semantics: the core ends at "bytes available"
//! - Shutdown stops accepting and closes connections; there is no drain of
//!   in-flight application work

pub mod buffer;
pub mod connection;
pub mod error;
pub mod handler;
pub mod server;
pub mod transport;
pub mod worker;

pub use error::ServerError;
