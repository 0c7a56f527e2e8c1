//! Integration tests for the TCP hub and bridge.
//!
//! These tests run the real hub over loopback sockets with a mock serial
//! transport (an in-memory duplex stream standing in for the port), so
//! they exercise the complete path a production deployment uses:
//!
//! ```text
//! TCP client ──text command──► hub ──frame──► link write pump ──► "serial wire"
//! "serial wire" ──frame──► link read pump ──► bridge ──RECEIVED line──► TCP client
//! ```
//!
//! Timing-sensitive tests shrink the heartbeat constants (production:
//! sweep every 2000 ms, evict after 9000 ms of silence) so they finish
//! quickly, and use generous upper bounds so they stay reliable on slow
//! machines.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use namo_core::protocol::codec::{decode_frame, encode_frame};
use namo_core::protocol::command::{GOODBYE_LINE, HEARTBEAT_LINE, WELCOME_LINE};
use namo_core::{Frame, FrameLimits, FrameType};
use namo_server::application::bridge::Bridge;
use namo_server::infrastructure::link::{LinkConfig, LinkStream, LinkTransport};
use namo_server::infrastructure::tcp_hub::{HubConfig, TcpHub};

/// Upper bound for any single await in these tests.
const TEST_DEADLINE: Duration = Duration::from_secs(10);

// ── Test doubles ──────────────────────────────────────────────────────────────

/// Transport that hands out one pre-made stream, then fails every
/// subsequent open (the "port" never comes back).
struct OnceTransport {
    stream: Mutex<Option<Box<dyn LinkStream>>>,
}

impl OnceTransport {
    fn new(stream: DuplexStream) -> Arc<Self> {
        Arc::new(Self {
            stream: Mutex::new(Some(Box::new(stream))),
        })
    }
}

#[async_trait]
impl LinkTransport for OnceTransport {
    async fn open(&self) -> io::Result<Box<dyn LinkStream>> {
        self.stream
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "port unavailable"))
    }
}

/// A running hub with one channel (`ch1`) whose far "serial" end the test
/// holds.
struct TestServer {
    addr: SocketAddr,
    serial_far: FrameReader,
    running: Arc<AtomicBool>,
    hub_task: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn start(heartbeat_interval: Duration, peer_timeout: Duration) -> Self {
        let (near, far) = tokio::io::duplex(64 * 1024);

        let mut bridge = Bridge::new(LinkConfig::default());
        bridge.add_channel("ch1", OnceTransport::new(near));
        let bridge = Arc::new(bridge);

        let running = Arc::new(AtomicBool::new(true));
        let hub = TcpHub::bind(
            HubConfig {
                listen_addr: "127.0.0.1:0".parse().unwrap(),
                heartbeat_interval,
                peer_timeout,
            },
            Arc::clone(&bridge),
            Arc::clone(&running),
        )
        .await
        .expect("bind hub");
        let addr = hub.local_addr().expect("local addr");

        let hub_task = tokio::spawn(async move {
            let _ = hub.run().await;
        });

        Self {
            addr,
            serial_far: FrameReader::new(far),
            running,
            hub_task,
        }
    }

    /// Starts a server with heartbeats effectively disabled, for tests
    /// that are not about liveness.
    async fn start_quiet() -> Self {
        Self::start(Duration::from_secs(600), Duration::from_secs(600)).await
    }

    fn stop(self) {
        self.running.store(false, Ordering::Relaxed);
        self.hub_task.abort();
    }
}

/// Reads complete frames off the far end of the mock serial wire.
struct FrameReader {
    stream: DuplexStream,
    buf: Vec<u8>,
}

impl FrameReader {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    async fn next_frame(&mut self) -> Frame {
        let limits = FrameLimits::default();
        let mut chunk = [0u8; 1024];
        loop {
            if let Ok((frame, consumed)) = decode_frame(&self.buf, &limits) {
                self.buf.drain(..consumed);
                return frame;
            }
            let n = timeout(TEST_DEADLINE, self.stream.read(&mut chunk))
                .await
                .expect("timed out waiting for a frame")
                .expect("serial wire closed");
            assert!(n > 0, "serial wire closed");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Injects one encoded frame, as the embedded endpoint would send it.
    async fn inject(&mut self, frame: &Frame) {
        let bytes = encode_frame(frame, &FrameLimits::default()).expect("encode");
        self.stream.write_all(&bytes).await.expect("inject frame");
    }
}

/// A TCP peer talking the text protocol to the hub.
struct TestClient {
    lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

impl TestClient {
    /// Connects and consumes the welcome banner.
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read, write) = stream.into_split();
        let mut client = Self {
            lines: BufReader::new(read).lines(),
            write,
        };
        let banner = client.next_line().await.expect("welcome line");
        assert_eq!(banner, WELCOME_LINE);
        client
    }

    async fn send(&mut self, line: &str) {
        let framed = format!("{line}\n");
        self.write.write_all(framed.as_bytes()).await.expect("send");
    }

    /// Next line from the server, `None` on clean close.
    async fn next_line(&mut self) -> Option<String> {
        timeout(TEST_DEADLINE, self.lines.next_line())
            .await
            .expect("timed out waiting for a server line")
            .expect("read line")
    }

    /// Next line that is not a heartbeat probe.
    async fn next_payload_line(&mut self) -> Option<String> {
        loop {
            match self.next_line().await {
                Some(line) if line == HEARTBEAT_LINE => continue,
                other => return other,
            }
        }
    }
}

// ── Command handling ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_connect_receives_welcome_banner() {
    let server = TestServer::start_quiet().await;
    // TestClient::connect asserts the banner.
    let _client = TestClient::connect(server.addr).await;
    server.stop();
}

#[tokio::test]
async fn test_quit_receives_goodbye_and_close() {
    let server = TestServer::start_quiet().await;
    let mut client = TestClient::connect(server.addr).await;

    client.send("QUIT").await;
    assert_eq!(client.next_line().await.as_deref(), Some(GOODBYE_LINE));
    assert_eq!(client.next_line().await, None, "socket must close after QUIT");

    server.stop();
}

#[tokio::test]
async fn test_text_command_reaches_the_serial_wire() {
    let mut server = TestServer::start_quiet().await;
    let mut client = TestClient::connect(server.addr).await;

    client.send("TEXT ch1 greeting hello").await;
    let reply = client.next_payload_line().await.expect("confirmation");
    assert_eq!(reply, "Sent TEXT to ch1 (key=greeting, value=hello)");

    let frame = server.serial_far.next_frame().await;
    assert_eq!(frame, Frame::text("greeting", "hello"));

    server.stop();
}

#[tokio::test]
async fn test_text_commands_preserve_fifo_order_on_one_channel() {
    let mut server = TestServer::start_quiet().await;
    let mut client = TestClient::connect(server.addr).await;

    client.send("TEXT ch1 greeting hello").await;
    client.send("TEXT ch1 greeting world").await;

    let first = server.serial_far.next_frame().await;
    let second = server.serial_far.next_frame().await;
    assert_eq!(String::from_utf8_lossy(&first.value), "hello");
    assert_eq!(String::from_utf8_lossy(&second.value), "world");

    server.stop();
}

#[tokio::test]
async fn test_csv_command_produces_fixed_key_binary_frame() {
    let mut server = TestServer::start_quiet().await;
    let mut client = TestClient::connect(server.addr).await;

    client.send("CSV ch1 LED 3,5").await;
    let reply = client.next_payload_line().await.expect("confirmation");
    assert_eq!(
        reply,
        "Sent CSV-converted BINARY to ch1 (LED_TOGGLE, 3 toggles, delay multiplier 5)"
    );

    let frame = server.serial_far.next_frame().await;
    assert_eq!(frame.key, "LED_TOGGLE");
    assert_eq!(frame.value, vec![0x03, 0x05]);
    assert_eq!(frame.frame_type, FrameType::Binary);

    server.stop();
}

#[tokio::test]
async fn test_odd_length_hex_yields_error_and_no_frame() {
    let mut server = TestServer::start_quiet().await;
    let mut client = TestClient::connect(server.addr).await;

    client.send("BINARY ch1 k1 ABC").await;
    let reply = client.next_payload_line().await.expect("error line");
    assert!(
        reply.starts_with("ERROR:"),
        "odd-length hex must be rejected, got {reply:?}"
    );

    // The offending command produced no frame: the next thing on the
    // serial wire is the follow-up TEXT frame.
    client.send("TEXT ch1 after ok").await;
    let frame = server.serial_far.next_frame().await;
    assert_eq!(frame, Frame::text("after", "ok"));

    server.stop();
}

#[tokio::test]
async fn test_unknown_channel_is_reported_not_fatal() {
    let server = TestServer::start_quiet().await;
    let mut client = TestClient::connect(server.addr).await;

    client.send("TEXT ch9 k v").await;
    let reply = client.next_payload_line().await.expect("error line");
    assert_eq!(reply, "ERROR: Port ch9 not found.");

    // The session survives the error.
    client.send("TEXT ch1 k v").await;
    let reply = client.next_payload_line().await.expect("confirmation");
    assert!(reply.starts_with("Sent TEXT to ch1"));

    server.stop();
}

#[tokio::test]
async fn test_malformed_command_keeps_session_alive() {
    let server = TestServer::start_quiet().await;
    let mut client = TestClient::connect(server.addr).await;

    for bad in ["TEXT ch1 onlykey", "HELLO ch1 k v", "CSV ch1 LED 300,5"] {
        client.send(bad).await;
        let reply = client.next_payload_line().await.expect("error line");
        assert!(reply.starts_with("ERROR:"), "line {bad:?} → {reply:?}");
    }

    server.stop();
}

// ── Inbound rebroadcast ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_inbound_frame_is_rebroadcast_as_received_line() {
    let mut server = TestServer::start_quiet().await;
    let mut client = TestClient::connect(server.addr).await;

    server.serial_far.inject(&Frame::text("greeting", "hello")).await;
    let line = client.next_payload_line().await.expect("publish line");
    assert_eq!(line, "RECEIVED TEXT ch1 greeting hello");

    server.serial_far.inject(&Frame::binary("blob", vec![0xDE, 0xAD])).await;
    let line = client.next_payload_line().await.expect("publish line");
    assert_eq!(line, "RECEIVED BINARY ch1 blob DEAD");

    server.stop();
}

#[tokio::test]
async fn test_broadcast_reaches_only_peers_active_at_broadcast_time() {
    let mut server = TestServer::start_quiet().await;
    let mut first = TestClient::connect(server.addr).await;

    // Published while only the first peer is connected.
    server.serial_far.inject(&Frame::text("seq", "one")).await;
    assert_eq!(
        first.next_payload_line().await.as_deref(),
        Some("RECEIVED TEXT ch1 seq one")
    );

    // A peer connecting afterwards does not retroactively receive it.
    let mut second = TestClient::connect(server.addr).await;
    server.serial_far.inject(&Frame::text("seq", "two")).await;

    assert_eq!(
        second.next_payload_line().await.as_deref(),
        Some("RECEIVED TEXT ch1 seq two"),
        "the late peer's first publish line must be the second message"
    );
    assert_eq!(
        first.next_payload_line().await.as_deref(),
        Some("RECEIVED TEXT ch1 seq two")
    );

    server.stop();
}

// ── Heartbeat liveness ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_silent_peer_is_evicted_after_timeout() {
    // Sweep every 100 ms, evict after 400 ms of silence.
    let server = TestServer::start(Duration::from_millis(100), Duration::from_millis(400)).await;
    let mut client = TestClient::connect(server.addr).await;

    // Never answer the probes; the server must close the connection.
    loop {
        match client.next_line().await {
            Some(line) => assert_eq!(line, HEARTBEAT_LINE, "only probes expected"),
            None => break,
        }
    }

    server.stop();
}

#[tokio::test]
async fn test_heartbeating_peer_is_never_evicted() {
    let server = TestServer::start(Duration::from_millis(100), Duration::from_millis(400)).await;
    let mut client = TestClient::connect(server.addr).await;

    // Answer every probe for well over the eviction threshold.
    let deadline = tokio::time::Instant::now() + Duration::from_millis(1500);
    while tokio::time::Instant::now() < deadline {
        let next = timeout(Duration::from_millis(200), client.lines.next_line()).await;
        match next {
            Ok(Ok(Some(line))) if line == HEARTBEAT_LINE => {
                client.send(HEARTBEAT_LINE).await;
            }
            Ok(Ok(Some(_))) => {}
            Ok(Ok(None)) | Ok(Err(_)) => panic!("peer was evicted despite heartbeating"),
            Err(_) => {}
        }
    }

    // Still alive: a command round-trips.
    client.send("TEXT ch1 k v").await;
    let reply = client.next_payload_line().await.expect("confirmation");
    assert!(reply.starts_with("Sent TEXT to ch1"));

    server.stop();
}
