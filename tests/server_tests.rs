//! End-to-end tests of the plain TCP engine: echo round-trips, buffer
//! growth and the saturation drop policy, write backpressure, sticky
//! worker affinity and teardown-once semantics.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use micro_tcp::ServerError;
use micro_tcp::handler::{ConnectionHandler, ConnectionIo, make_handler};
use micro_tcp::server::{Server, ServerConfig, ServerHandle};

const IO_TIMEOUT: Duration = Duration::from_secs(5);

fn start_echo(workers: usize) -> ServerHandle {
    let config =
        ServerConfig::builder().address("127.0.0.1:0".parse().unwrap()).workers(workers).build().unwrap();
    let handler = make_handler(|io: &mut ConnectionIo<'_>| {
        let payload = io.bytes().to_vec();
        io.consume(payload.len());
        io.send(payload);
    });
    Server::new(config, handler).start().unwrap()
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
    stream
}

fn wait_until(cond: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    cond()
}

#[test]
fn test_echo_round_trip() {
    let handle = start_echo(2);
    let mut stream = connect(handle.local_addr());

    stream.write_all(b"hello").unwrap();
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello");

    drop(stream);
    handle.shutdown();
}

#[test]
fn test_multiple_messages_on_one_connection() {
    let handle = start_echo(2);
    let mut stream = connect(handle.local_addr());

    for msg in [&b"ping"[..], b"pong", b"done"] {
        stream.write_all(msg).unwrap();
        let mut buf = vec![0u8; msg.len()];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(buf, msg);
    }

    drop(stream);
    handle.shutdown();
}

/// Replies with the accumulated byte count once at least `threshold` bytes
/// are buffered; consumes nothing before that, forcing the input buffer to
/// grow past its initial capacity.
struct ThresholdHandler {
    threshold: usize,
}

impl ConnectionHandler for ThresholdHandler {
    fn on_data(&self, io: &mut ConnectionIo<'_>) {
        let buffered = io.bytes().len();
        if buffered >= self.threshold {
            io.consume(buffered);
            io.send(format!("{buffered}"));
        }
    }
}

#[test]
fn test_streamed_message_grows_input_buffer() {
    let total: usize = 20 * 1024;
    let config =
        ServerConfig::builder().address("127.0.0.1:0".parse().unwrap()).workers(1).build().unwrap();
    let handle = Server::new(config, ThresholdHandler { threshold: total }).start().unwrap();

    let mut stream = connect(handle.local_addr());
    let chunk = vec![0x5A; 1024];
    for _ in 0..(total / chunk.len()) {
        stream.write_all(&chunk).unwrap();
    }

    // The reply is the byte count seen once everything accumulated,
    // which only works if the buffer grew past its 10 KiB default.
    let mut reply = [0u8; 5];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"20480");

    drop(stream);
    handle.shutdown();
}

/// Echoes and records which worker thread touched each peer.
struct AffinityProbe {
    seen: Arc<Mutex<HashMap<SocketAddr, HashSet<ThreadId>>>>,
}

impl ConnectionHandler for AffinityProbe {
    fn on_data(&self, io: &mut ConnectionIo<'_>) {
        self.seen
            .lock()
            .unwrap()
            .entry(io.peer_addr())
            .or_default()
            .insert(std::thread::current().id());
        let payload = io.bytes().to_vec();
        io.consume(payload.len());
        io.send(payload);
    }
}

#[test]
fn test_affinity_is_sticky_across_interleaved_connections() {
    let seen = Arc::new(Mutex::new(HashMap::new()));
    let config =
        ServerConfig::builder().address("127.0.0.1:0".parse().unwrap()).workers(2).build().unwrap();
    let handle = Server::new(config, AffinityProbe { seen: Arc::clone(&seen) }).start().unwrap();

    let mut a = connect(handle.local_addr());
    let mut b = connect(handle.local_addr());
    let a_addr = a.local_addr().unwrap();
    let b_addr = b.local_addr().unwrap();

    // 100 interleaved events across the two connections; each round trip
    // proves the owning worker processed the event.
    let mut buf = [0u8; 1];
    for _ in 0..50 {
        a.write_all(b"a").unwrap();
        a.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"a");

        b.write_all(b"b").unwrap();
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"b");
    }

    let seen = seen.lock().unwrap();
    assert_eq!(seen[&a_addr].len(), 1, "connection A hopped workers");
    assert_eq!(seen[&b_addr].len(), 1, "connection B hopped workers");

    drop(a);
    drop(b);
    drop(seen);
    handle.shutdown();
}

/// Echoes while counting lifecycle callbacks.
struct LifecycleProbe {
    connects: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl ConnectionHandler for LifecycleProbe {
    fn on_data(&self, io: &mut ConnectionIo<'_>) {
        let payload = io.bytes().to_vec();
        io.consume(payload.len());
        io.send(payload);
    }

    fn on_connect(&self, _peer: SocketAddr) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_close(&self, _peer: SocketAddr) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn start_lifecycle_probe() -> (ServerHandle, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let connects = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));
    let config =
        ServerConfig::builder().address("127.0.0.1:0".parse().unwrap()).workers(2).build().unwrap();
    let handler = LifecycleProbe { connects: Arc::clone(&connects), closes: Arc::clone(&closes) };
    let handle = Server::new(config, handler).start().unwrap();
    (handle, connects, closes)
}

#[test]
fn test_orderly_close_tears_down_exactly_once() {
    let (handle, connects, closes) = start_lifecycle_probe();

    let mut stream = connect(handle.local_addr());
    stream.write_all(b"bye").unwrap();
    let mut buf = [0u8; 3];
    stream.read_exact(&mut buf).unwrap();
    drop(stream);

    assert!(wait_until(|| closes.load(Ordering::SeqCst) == 1, IO_TIMEOUT), "teardown never ran");
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    // A duplicate/stale event must not tear down twice.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    handle.shutdown();
}

#[test]
fn test_connection_reset_tears_down_exactly_once() {
    let (handle, _connects, closes) = start_lifecycle_probe();
    let addr = handle.local_addr();

    let socket =
        socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, Some(socket2::Protocol::TCP))
            .unwrap();
    socket.connect(&addr.into()).unwrap();
    // Zero linger turns close into an RST instead of a FIN.
    socket.set_linger(Some(Duration::from_secs(0))).unwrap();
    let mut stream: TcpStream = socket.into();
    stream.set_read_timeout(Some(IO_TIMEOUT)).unwrap();

    // Round-trip once so the server has definitely registered the
    // connection before the reset arrives.
    stream.write_all(b"x").unwrap();
    let mut buf = [0u8; 1];
    stream.read_exact(&mut buf).unwrap();
    drop(stream);

    assert!(wait_until(|| closes.load(Ordering::SeqCst) == 1, IO_TIMEOUT), "teardown never ran");
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    handle.shutdown();
}

#[test]
fn test_rapid_reconnects_keep_routing_intact() {
    let handle = start_echo(2);
    let mut long_lived = connect(handle.local_addr());
    let mut buf = [0u8; 1];

    // Each short-lived connection closes before the next connect, so the
    // kernel hands the same descriptor values out over and over. Every
    // round trip proves the reused descriptor still routes to its owner.
    for _ in 0..100 {
        let mut short = connect(handle.local_addr());
        short.write_all(b"s").unwrap();
        short.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"s");
        drop(short);

        long_lived.write_all(b"l").unwrap();
        long_lived.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"l");
    }

    drop(long_lived);
    handle.shutdown();
}

/// Accumulates without ever consuming, while counting teardowns.
struct NeverConsume {
    closes: Arc<AtomicUsize>,
}

impl ConnectionHandler for NeverConsume {
    fn on_data(&self, _io: &mut ConnectionIo<'_>) {}

    fn on_close(&self, _peer: SocketAddr) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_unconsumed_message_over_cap_drops_connection() {
    let closes = Arc::new(AtomicUsize::new(0));
    let config =
        ServerConfig::builder().address("127.0.0.1:0".parse().unwrap()).workers(1).build().unwrap();
    let handle = Server::new(config, NeverConsume { closes: Arc::clone(&closes) }).start().unwrap();

    let mut stream = connect(handle.local_addr());
    stream.set_write_timeout(Some(IO_TIMEOUT)).unwrap();

    // 3 MiB with nothing ever consumed saturates the 1 MiB cap. Once the
    // server drops the connection the remaining writes fail; either way
    // enough bytes get through to trigger the drop.
    let chunk = vec![0x42u8; 64 * 1024];
    for _ in 0..48 {
        if stream.write_all(&chunk).is_err() {
            break;
        }
    }

    assert!(wait_until(|| closes.load(Ordering::SeqCst) == 1, IO_TIMEOUT), "connection was never dropped");

    // The drop is visible to the client as EOF or a reset, never a reply.
    let mut buf = [0u8; 1];
    match stream.read(&mut buf) {
        Ok(n) => assert_eq!(n, 0, "unexpected reply from a dropped connection"),
        Err(_) => {}
    }

    drop(stream);
    handle.shutdown();
}

/// Replies to any message with one payload far larger than the socket
/// buffers can take in a single write.
struct BigReply {
    size: usize,
}

impl ConnectionHandler for BigReply {
    fn on_data(&self, io: &mut ConnectionIo<'_>) {
        let buffered = io.bytes().len();
        io.consume(buffered);
        io.send(vec![0x52u8; self.size]);
    }
}

#[test]
fn test_large_reply_completes_with_slow_reader() {
    let size: usize = 8 * 1024 * 1024;
    let config =
        ServerConfig::builder().address("127.0.0.1:0".parse().unwrap()).workers(1).build().unwrap();
    let handle = Server::new(config, BigReply { size }).start().unwrap();

    let mut stream = connect(handle.local_addr());
    stream.write_all(b"go").unwrap();

    // While the client sits idle the server's first flush stalls against
    // full socket buffers; the reply can only complete through writable
    // readiness events afterwards.
    std::thread::sleep(Duration::from_millis(300));

    let mut reply = vec![0u8; size];
    stream.read_exact(&mut reply).unwrap();
    assert!(reply.iter().all(|b| *b == 0x52), "reply payload corrupted");

    drop(stream);
    handle.shutdown();
}

#[test]
fn test_bind_conflict_is_fatal_at_startup() {
    let handle = start_echo(1);
    let taken = handle.local_addr();

    let config = ServerConfig::builder().address(taken).workers(1).build().unwrap();
    let handler = make_handler(|_io: &mut ConnectionIo<'_>| {});
    let err = Server::new(config, handler).start().unwrap_err();
    assert!(matches!(err, ServerError::Bind { .. }), "unexpected error: {err}");

    handle.shutdown();
}
