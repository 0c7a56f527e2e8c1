//! Per-channel serial link session: connect, read pump, write pump, and
//! automatic reconnection.
//!
//! Each channel is driven by **one owning task** that sequences the
//! connection state machine:
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected ──(I/O error)──► Disconnected
//!                      ▲                                          │
//!                      └────────────── 300 ms delay ──────────────┘
//! ```
//!
//! While `Connected`, the task drives a read pump and a write pump
//! concurrently over the split transport stream; when either pump fails
//! the stream is dropped and the task returns to the retry loop.  Because
//! a single task owns the whole lifecycle there is never more than one
//! reconnection loop per channel, and it only runs while not connected.
//!
//! Failures are channel-local: nothing here is ever surfaced to the
//! bridge or to other channels.
//!
//! # Streaming decode
//!
//! The transport is a byte stream; one read may return a fraction of a
//! frame or several frames at once.  Received bytes accumulate in a
//! buffer and complete frames are decoded off the front.  While a partial
//! frame is buffered, each wait for more bytes is bounded by the stall
//! window; if nothing arrives in time the buffered bytes are discarded
//! and the pump waits for the next frame boundary (no resynchronisation
//! search; sender and receiver are assumed to stay frame-aligned).

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use namo_core::{decode_frame, encode_frame, CodecError, Frame, FrameLimits};

/// Connection state of one serial channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Byte stream carrying framed messages for one channel.
pub trait LinkStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> LinkStream for T {}

/// Opens the underlying transport for a channel.
///
/// The production implementation is
/// [`SerialLinkTransport`](super::serial::SerialLinkTransport); tests
/// substitute in-memory duplex streams.
#[async_trait]
pub trait LinkTransport: Send + Sync + 'static {
    async fn open(&self) -> io::Result<Box<dyn LinkStream>>;
}

/// Tuning knobs shared by every link session.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Delay between reconnection attempts.
    pub reconnect_delay: Duration,
    /// Stall window for a partially received frame.
    pub read_stall: Duration,
    /// Frame size limits applied on both encode and decode.
    pub limits: FrameLimits,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_millis(300),
            read_stall: Duration::from_millis(1000),
            limits: FrameLimits::default(),
        }
    }
}

/// One frame received from a channel, tagged with its source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub channel: String,
    pub frame: Frame,
}

/// Handle to a running link session.
///
/// Exactly one owning task mutates the channel's connection; the handle
/// only enqueues outbound frames and reads the published state.
pub struct LinkHandle {
    name: String,
    outbound: mpsc::UnboundedSender<Frame>,
    state: watch::Receiver<LinkState>,
    task: tokio::task::JoinHandle<()>,
}

impl LinkHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues a frame for transmission on this channel.
    ///
    /// Always accepted regardless of connection state and never blocks
    /// the caller; frames queued while disconnected are flushed once the
    /// link reconnects, or lost at shutdown.  The queue is unbounded: a
    /// stalled channel accumulates frames rather than exerting
    /// backpressure on producers.
    pub fn enqueue(&self, frame: Frame) {
        // The receiver lives as long as the owning task; a send can only
        // fail after shutdown, where dropping the frame is correct.
        let _ = self.outbound.send(frame);
    }

    /// Current connection state.
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Watch receiver for state transitions, for callers that need to
    /// await a particular state.
    pub fn state_watch(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Stops the owning task, force-closing any open transport handle.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

/// Spawns the owning task for one channel and returns its handle.
///
/// If the initial open succeeds the channel starts out `Connected`;
/// otherwise it stays `Disconnected` and the retry loop takes over.
pub fn spawn_link(
    name: impl Into<String>,
    transport: Arc<dyn LinkTransport>,
    config: LinkConfig,
    inbound_tx: broadcast::Sender<InboundMessage>,
) -> LinkHandle {
    let name = name.into();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);

    let task_name = name.clone();
    let task = tokio::spawn(async move {
        run_link(task_name, transport, config, state_tx, out_rx, inbound_tx).await;
    });

    LinkHandle {
        name,
        outbound: out_tx,
        state: state_rx,
        task,
    }
}

/// The owning task: sequences the state machine for one channel forever.
async fn run_link(
    name: String,
    transport: Arc<dyn LinkTransport>,
    config: LinkConfig,
    state_tx: watch::Sender<LinkState>,
    mut out_rx: mpsc::UnboundedReceiver<Frame>,
    inbound_tx: broadcast::Sender<InboundMessage>,
) {
    loop {
        let _ = state_tx.send(LinkState::Connecting);
        match transport.open().await {
            Ok(stream) => {
                info!("channel {name}: opened");
                let _ = state_tx.send(LinkState::Connected);
                run_connected(&name, stream, &config, &mut out_rx, &inbound_tx).await;
                warn!("channel {name}: disconnected; will attempt to reconnect");
            }
            Err(e) => {
                warn!("channel {name}: failed to open: {e}");
            }
        }
        let _ = state_tx.send(LinkState::Disconnected);
        tokio::time::sleep(config.reconnect_delay).await;
    }
}

/// Drives the read and write pumps over one open transport stream.
///
/// Returns when either pump hits a fatal transport error; the stream is
/// dropped (closing the handle) on the way out.
async fn run_connected(
    name: &str,
    stream: Box<dyn LinkStream>,
    config: &LinkConfig,
    out_rx: &mut mpsc::UnboundedReceiver<Frame>,
    inbound_tx: &broadcast::Sender<InboundMessage>,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);

    let read_pump = async {
        let mut recv_buf: Vec<u8> = Vec::with_capacity(4096);
        let mut chunk = vec![0u8; 4096];

        loop {
            // Decode as many complete frames as the buffer holds.
            loop {
                match decode_frame(&recv_buf, &config.limits) {
                    Ok((frame, consumed)) => {
                        recv_buf.drain(..consumed);
                        debug!(
                            "channel {name}: received key={} valueLen={} type={:?}",
                            frame.key,
                            frame.value.len(),
                            frame.frame_type
                        );
                        // No receivers (hub not yet running) just drops the frame.
                        let _ = inbound_tx.send(InboundMessage {
                            channel: name.to_string(),
                            frame,
                        });
                    }
                    Err(CodecError::InsufficientData { .. }) => break,
                    Err(e) => {
                        // Malformed header or body: non-fatal.  Discard and
                        // wait for the next frame boundary.
                        warn!(
                            "channel {name}: {e}; discarding {} buffered byte(s)",
                            recv_buf.len()
                        );
                        recv_buf.clear();
                        break;
                    }
                }
            }

            // Wait for more bytes.  Mid-frame the wait is bounded by the
            // stall window, which restarts whenever bytes arrive.
            let read = reader.read(&mut chunk);
            let n = if recv_buf.is_empty() {
                match read.await {
                    Ok(0) => return,
                    Ok(n) => n,
                    Err(e) => {
                        warn!("channel {name}: read failed: {e}");
                        return;
                    }
                }
            } else {
                match timeout(config.read_stall, read).await {
                    Ok(Ok(0)) => return,
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) => {
                        warn!("channel {name}: read failed: {e}");
                        return;
                    }
                    Err(_) => {
                        warn!(
                            "channel {name}: stalled mid-frame; discarding {} buffered byte(s)",
                            recv_buf.len()
                        );
                        recv_buf.clear();
                        continue;
                    }
                }
            };
            recv_buf.extend_from_slice(&chunk[..n]);
        }
    };

    let write_pump = async {
        while let Some(frame) = out_rx.recv().await {
            let bytes = match encode_frame(&frame, &config.limits) {
                Ok(bytes) => bytes,
                Err(e) => {
                    // Rejected before any bytes reach the wire; the link
                    // stays up and later frames are unaffected.
                    warn!("channel {name}: dropping outbound frame: {e}");
                    continue;
                }
            };
            debug!(
                "channel {name}: sending key={} valueLen={}",
                frame.key,
                frame.value.len()
            );
            if let Err(e) = writer.write_all(&bytes).await {
                // The failed frame is dropped, not requeued (at-most-once).
                warn!("channel {name}: write failed: {e}");
                return;
            }
            if let Err(e) = writer.flush().await {
                warn!("channel {name}: flush failed: {e}");
                return;
            }
        }
        // All senders dropped: the session is shutting down.
    };

    tokio::select! {
        _ = read_pump => {}
        _ = write_pump => {}
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Test transport that hands out a scripted sequence of streams.
    ///
    /// Each `open()` pops the next entry: `Some(stream)` connects, `None`
    /// simulates an open failure.  The far ends of duplex streams stay
    /// with the test so it can observe written bytes and inject reads.
    struct ScriptedTransport {
        streams: Mutex<VecDeque<Option<Box<dyn LinkStream>>>>,
    }

    impl ScriptedTransport {
        fn new(streams: Vec<Option<Box<dyn LinkStream>>>) -> Arc<Self> {
            Arc::new(Self {
                streams: Mutex::new(streams.into()),
            })
        }
    }

    #[async_trait]
    impl LinkTransport for ScriptedTransport {
        async fn open(&self) -> io::Result<Box<dyn LinkStream>> {
            let next = self.streams.lock().unwrap().pop_front();
            match next {
                Some(Some(stream)) => Ok(stream),
                _ => Err(io::Error::new(io::ErrorKind::NotFound, "port unavailable")),
            }
        }
    }

    /// Stream whose reads stay pending forever and whose writes always
    /// fail, to exercise the write pump's failure path deterministically.
    struct WriteFailStream;

    impl AsyncRead for WriteFailStream {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Pending
        }
    }

    impl AsyncWrite for WriteFailStream {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &[u8],
        ) -> std::task::Poll<io::Result<usize>> {
            std::task::Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "port unplugged",
            )))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    fn test_config() -> LinkConfig {
        LinkConfig::default()
    }

    async fn wait_for_state(handle: &LinkHandle, want: LinkState) {
        let mut rx = handle.state_watch();
        loop {
            if *rx.borrow() == want {
                return;
            }
            rx.changed().await.expect("state channel closed");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_connects_when_open_succeeds() {
        let (near, _far) = tokio::io::duplex(1024);
        let transport = ScriptedTransport::new(vec![Some(Box::new(near) as Box<dyn LinkStream>)]);
        let (inbound_tx, _inbound_rx) = broadcast::channel(16);

        let handle = spawn_link("ch1", transport, test_config(), inbound_tx);
        wait_for_state(&handle, LinkState::Connected).await;

        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_stays_disconnected_while_open_fails() {
        let transport = ScriptedTransport::new(vec![]);
        let (inbound_tx, _inbound_rx) = broadcast::channel(16);

        let handle = spawn_link("ch1", transport, test_config(), inbound_tx);
        wait_for_state(&handle, LinkState::Disconnected).await;

        // A few retry periods later it is still down.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(handle.state(), LinkState::Disconnected);

        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueued_frames_reach_the_wire_in_fifo_order() {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let transport = ScriptedTransport::new(vec![Some(Box::new(near) as Box<dyn LinkStream>)]);
        let (inbound_tx, _inbound_rx) = broadcast::channel(16);

        let handle = spawn_link("ch1", transport, test_config(), inbound_tx);

        // Queued before the pump is necessarily running; order must hold.
        handle.enqueue(Frame::text("greeting", "hello"));
        handle.enqueue(Frame::text("greeting", "world"));

        let limits = FrameLimits::default();
        let mut expected = encode_frame(&Frame::text("greeting", "hello"), &limits).unwrap();
        expected.extend(encode_frame(&Frame::text("greeting", "world"), &limits).unwrap());

        let mut far = far;
        let mut wire = vec![0u8; expected.len()];
        far.read_exact(&mut wire).await.expect("read framed bytes");
        assert_eq!(wire, expected);

        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_bytes_decode_and_publish() {
        let (near, far) = tokio::io::duplex(1024);
        let transport = ScriptedTransport::new(vec![Some(Box::new(near) as Box<dyn LinkStream>)]);
        let (inbound_tx, mut inbound_rx) = broadcast::channel(16);

        let handle = spawn_link("ch1", transport, test_config(), inbound_tx);

        let frame = Frame::binary("LED_TOGGLE", vec![0x03, 0x05]);
        let bytes = encode_frame(&frame, &FrameLimits::default()).unwrap();
        let mut far = far;
        far.write_all(&bytes).await.unwrap();

        let msg = inbound_rx.recv().await.expect("published message");
        assert_eq!(msg.channel, "ch1");
        assert_eq!(msg.frame, frame);

        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_header_is_discarded_and_link_survives() {
        let (near, far) = tokio::io::duplex(1024);
        let transport = ScriptedTransport::new(vec![Some(Box::new(near) as Box<dyn LinkStream>)]);
        let (inbound_tx, mut inbound_rx) = broadcast::channel(16);

        let handle = spawn_link("ch1", transport, test_config(), inbound_tx);

        // A header with key_len = 0 is malformed; the pump must discard it
        // and keep decoding the valid frame that follows.
        let mut far = far;
        far.write_all(&[0u8; 8]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let frame = Frame::text("greeting", "still alive");
        far.write_all(&encode_frame(&frame, &FrameLimits::default()).unwrap())
            .await
            .unwrap();

        let msg = inbound_rx.recv().await.expect("published message");
        assert_eq!(msg.frame, frame);
        assert_eq!(handle.state(), LinkState::Connected);

        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_partial_frame_is_discarded() {
        let (near, far) = tokio::io::duplex(1024);
        let transport = ScriptedTransport::new(vec![Some(Box::new(near) as Box<dyn LinkStream>)]);
        let (inbound_tx, mut inbound_rx) = broadcast::channel(16);

        let config = LinkConfig {
            read_stall: Duration::from_millis(200),
            ..LinkConfig::default()
        };
        let handle = spawn_link("ch1", transport, config, inbound_tx);

        let limits = FrameLimits::default();
        let frame = Frame::text("greeting", "hello");
        let bytes = encode_frame(&frame, &limits).unwrap();

        // Send only half a frame, then go silent past the stall window.
        let mut far = far;
        far.write_all(&bytes[..bytes.len() / 2]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        // The partial bytes were discarded; a complete frame now decodes
        // cleanly from the fresh boundary.
        far.write_all(&bytes).await.unwrap();
        let msg = inbound_rx.recv().await.expect("published message");
        assert_eq!(msg.frame, frame);

        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_disconnects_then_reconnects() {
        // First connection fails on the first write; the next open fails
        // once, then a healthy stream becomes available.
        let (near2, far2) = tokio::io::duplex(1024);
        let transport = ScriptedTransport::new(vec![
            Some(Box::new(WriteFailStream) as Box<dyn LinkStream>),
            None,
            Some(Box::new(near2) as Box<dyn LinkStream>),
        ]);
        let (inbound_tx, _inbound_rx) = broadcast::channel(16);

        let handle = spawn_link("ch1", transport, test_config(), inbound_tx);
        wait_for_state(&handle, LinkState::Connected).await;

        handle.enqueue(Frame::text("k", "lost in transit"));
        wait_for_state(&handle, LinkState::Disconnected).await;

        // One failed open later, the link comes back up: the liveness
        // property: Disconnected eventually becomes Connected again once
        // the transport is available.
        wait_for_state(&handle, LinkState::Connected).await;

        // The frame that hit the failed write was dropped, not requeued:
        // a fresh frame is the first thing on the new wire.
        handle.enqueue(Frame::text("k", "after reconnect"));
        let expected =
            encode_frame(&Frame::text("k", "after reconnect"), &FrameLimits::default()).unwrap();
        let mut far2 = far2;
        let mut wire = vec![0u8; expected.len()];
        far2.read_exact(&mut wire).await.expect("read framed bytes");
        assert_eq!(wire, expected);

        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_frame_is_dropped_without_killing_the_link() {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let transport = ScriptedTransport::new(vec![Some(Box::new(near) as Box<dyn LinkStream>)]);
        let (inbound_tx, _inbound_rx) = broadcast::channel(16);

        let handle = spawn_link("ch1", transport, test_config(), inbound_tx);

        handle.enqueue(Frame::binary("big", vec![0; 5000]));
        handle.enqueue(Frame::text("k", "small"));

        // Only the small frame reaches the wire.
        let expected = encode_frame(&Frame::text("k", "small"), &FrameLimits::default()).unwrap();
        let mut far = far;
        let mut wire = vec![0u8; expected.len()];
        far.read_exact(&mut wire).await.expect("read framed bytes");
        assert_eq!(wire, expected);
        assert_eq!(handle.state(), LinkState::Connected);

        handle.shutdown();
    }
}
