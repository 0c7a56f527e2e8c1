//! TCP hub: accept loop, per-peer sessions, heartbeat sweep, and
//! broadcast of inbound serial messages.
//!
//! Each accepted connection becomes a [`ClientPeer`] with two dedicated
//! tasks: a read loop parsing newline-delimited commands and a writer
//! task draining the peer's outbound line queue.  The active peer set is
//! guarded by one coarse lock covering insert (accept), iterate (sweep),
//! update (heartbeat refresh), and remove (evict), so the sweep never
//! observes a partially mutated set.
//!
//! Broadcast deliberately does **not** hold the lock across socket
//! writes: it snapshots the outbound sinks and then sends, so a broadcast
//! may race a concurrent eviction; the send to an evicted peer fails
//! safely and is ignored.  Eviction happens only via the sweep or the
//! peer's own read-loop termination, never from a failed broadcast write.
//!
//! Peer-local failures never cross into other peers or into the bridge.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, warn};

use namo_core::protocol::command::{
    format_received, CSV_FORWARD_KEY, GOODBYE_LINE, HEARTBEAT_LINE, WELCOME_LINE,
};
use namo_core::{parse_command, Command, Frame};

use crate::application::bridge::Bridge;
use crate::infrastructure::link::InboundMessage;

/// Configuration for the TCP hub.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Address to listen on.
    pub listen_addr: SocketAddr,
    /// Period of the heartbeat sweep.
    pub heartbeat_interval: Duration,
    /// Silence threshold after which a peer is evicted.
    pub peer_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9000".parse().unwrap(),
            heartbeat_interval: Duration::from_millis(2000),
            peer_timeout: Duration::from_millis(9000),
        }
    }
}

/// One connected TCP peer.
struct ClientPeer {
    /// Outbound line sink, drained by the peer's writer task.
    outbound: mpsc::UnboundedSender<String>,
    /// Refreshed by inbound `HEARTBEAT` lines; read by the sweep.
    last_heartbeat: Instant,
    /// Force-closes the read loop on eviction.
    read_task: tokio::task::AbortHandle,
}

type PeerMap = Arc<Mutex<HashMap<SocketAddr, ClientPeer>>>;

/// The TCP hub.  Bind first (so tests can learn the ephemeral port), then
/// run the accept loop.
pub struct TcpHub {
    config: HubConfig,
    listener: TcpListener,
    bridge: Arc<Bridge>,
    peers: PeerMap,
    running: Arc<AtomicBool>,
}

impl TcpHub {
    /// Binds the TCP listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound (port in use,
    /// missing permission).
    pub async fn bind(
        config: HubConfig,
        bridge: Arc<Bridge>,
        running: Arc<AtomicBool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .with_context(|| format!("failed to bind TCP listener on {}", config.listen_addr))?;
        Ok(Self {
            config,
            listener,
            bridge,
            peers: Arc::new(Mutex::new(HashMap::new())),
            running,
        })
    }

    /// The address the hub actually listens on.
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener.local_addr().context("no local address")
    }

    /// Runs the hub until the running flag is cleared: accepts peers,
    /// sweeps heartbeats, and rebroadcasts inbound serial messages.
    pub async fn run(self) -> anyhow::Result<()> {
        info!("serial server listening on {}", self.local_addr()?);

        // ── Republish task: serial inbound → every active peer ───────────────
        let republish_task = tokio::spawn(republish_inbound(
            self.bridge.subscribe(),
            Arc::clone(&self.peers),
        ));

        // ── Heartbeat sweep ──────────────────────────────────────────────────
        let sweep_task = tokio::spawn(heartbeat_sweep(
            Arc::clone(&self.peers),
            self.config.heartbeat_interval,
            self.config.peer_timeout,
            Arc::clone(&self.running),
        ));

        // ── Accept loop ──────────────────────────────────────────────────────
        loop {
            if !self.running.load(Ordering::Relaxed) {
                info!("shutdown flag set; stopping accept loop");
                break;
            }

            // Short timeout so the loop observes the running flag even
            // when no peers are connecting.
            match timeout(Duration::from_millis(200), self.listener.accept()).await {
                Ok(Ok((stream, peer_addr))) => {
                    info!("client connected from {peer_addr}");
                    register_peer(
                        stream,
                        peer_addr,
                        Arc::clone(&self.peers),
                        Arc::clone(&self.bridge),
                    )
                    .await;
                }
                Ok(Err(e)) => {
                    // Transient accept error; keep serving other peers.
                    error!("accept error: {e}");
                }
                Err(_) => {
                    // Timeout: loop back and check the running flag.
                }
            }
        }

        // ── Drain ────────────────────────────────────────────────────────────
        sweep_task.abort();
        republish_task.abort();
        let mut peers = self.peers.lock().await;
        for (addr, peer) in peers.drain() {
            debug!("closing session {addr}");
            peer.read_task.abort();
        }
        Ok(())
    }
}

// ── Peer lifecycle ────────────────────────────────────────────────────────────

/// Wires up one accepted connection: writer task, read loop, welcome
/// line, and registration in the active set.
async fn register_peer(stream: TcpStream, addr: SocketAddr, peers: PeerMap, bridge: Arc<Bridge>) {
    let (read_half, write_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();

    // Hold the set lock across spawn + insert: the read loop's eventual
    // self-removal waits on this lock, so it can never run before the
    // entry exists, and once a peer observes its welcome line it is
    // already visible to the sweep and to broadcasts.
    let mut registered = peers.lock().await;

    tokio::spawn(write_lines(write_half, out_rx, addr));
    let read_task = tokio::spawn(peer_read_loop(
        read_half,
        addr,
        Arc::clone(&peers),
        bridge,
        out_tx.clone(),
    ));

    let _ = out_tx.send(WELCOME_LINE.to_string());
    registered.insert(
        addr,
        ClientPeer {
            outbound: out_tx,
            last_heartbeat: Instant::now(),
            read_task: read_task.abort_handle(),
        },
    );
}

/// Writer task: drains the peer's line queue onto the socket.
///
/// Ends when every sender is gone (peer removed + read loop finished) or
/// on a write failure; either way the write half drops and the socket
/// closes once the read half is gone too.
async fn write_lines(
    mut write_half: OwnedWriteHalf,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    addr: SocketAddr,
) {
    while let Some(line) = out_rx.recv().await {
        let framed = format!("{line}\n");
        if let Err(e) = write_half.write_all(framed.as_bytes()).await {
            debug!("session {addr}: write failed: {e}");
            break;
        }
    }
}

/// Per-peer read loop: parses newline-delimited commands until QUIT, EOF,
/// or a socket error, then removes the peer from the active set.
async fn peer_read_loop(
    read_half: OwnedReadHalf,
    addr: SocketAddr,
    peers: PeerMap,
    bridge: Arc<Bridge>,
    out: mpsc::UnboundedSender<String>,
) {
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("session {addr}: peer closed the connection");
                break;
            }
            Err(e) => {
                debug!("session {addr}: read error: {e}");
                break;
            }
        };

        match parse_command(&line) {
            Ok(Command::Heartbeat) => {
                if let Some(peer) = peers.lock().await.get_mut(&addr) {
                    peer.last_heartbeat = Instant::now();
                }
            }
            Ok(Command::Quit) => {
                let _ = out.send(GOODBYE_LINE.to_string());
                break;
            }
            Ok(Command::SendText {
                channel,
                key,
                value,
            }) => {
                let reply = match bridge.send(&channel, Frame::text(key.clone(), value.clone())) {
                    Ok(()) => format!("Sent TEXT to {channel} (key={key}, value={value})"),
                    Err(e) => format!("ERROR: {e}"),
                };
                let _ = out.send(reply);
            }
            Ok(Command::SendBinary {
                channel,
                key,
                payload,
            }) => {
                let len = payload.len();
                let reply = match bridge.send(&channel, Frame::binary(key.clone(), payload)) {
                    Ok(()) => format!("Sent BINARY to {channel} (key={key}, {len} bytes)"),
                    Err(e) => format!("ERROR: {e}"),
                };
                let _ = out.send(reply);
            }
            Ok(Command::SendCsv {
                channel,
                count,
                delay_multiplier,
                ..
            }) => {
                let frame = Frame::binary(CSV_FORWARD_KEY, vec![count, delay_multiplier]);
                let reply = match bridge.send(&channel, frame) {
                    Ok(()) => format!(
                        "Sent CSV-converted BINARY to {channel} ({CSV_FORWARD_KEY}, {count} \
                         toggles, delay multiplier {delay_multiplier})"
                    ),
                    Err(e) => format!("ERROR: {e}"),
                };
                let _ = out.send(reply);
            }
            Err(e) => {
                let _ = out.send(format!("ERROR: {e}"));
            }
        }
    }

    // Self-eviction: dropping the map's sender (and ours, on return) lets
    // the writer task drain any farewell line and exit.
    peers.lock().await.remove(&addr);
}

// ── Heartbeat sweep ───────────────────────────────────────────────────────────

/// One shared scheduled task: every `period`, evict peers silent for
/// longer than `peer_timeout` and send a heartbeat line to the rest.
async fn heartbeat_sweep(
    peers: PeerMap,
    period: Duration,
    peer_timeout: Duration,
    running: Arc<AtomicBool>,
) {
    let mut ticker = interval(period);
    ticker.tick().await; // Skip the immediate first tick.

    loop {
        ticker.tick().await;
        if !running.load(Ordering::Relaxed) {
            break;
        }

        let now = Instant::now();
        let mut peers = peers.lock().await;
        peers.retain(|addr, peer| {
            if now.duration_since(peer.last_heartbeat) > peer_timeout {
                info!("client {addr} timed out; closing connection");
                peer.read_task.abort();
                false
            } else {
                let _ = peer.outbound.send(HEARTBEAT_LINE.to_string());
                true
            }
        });
    }
}

// ── Broadcast ─────────────────────────────────────────────────────────────────

/// Rebroadcasts every inbound serial message as a `RECEIVED` line to all
/// peers active at that moment.
async fn republish_inbound(
    mut rx: tokio::sync::broadcast::Receiver<InboundMessage>,
    peers: PeerMap,
) {
    loop {
        match rx.recv().await {
            Ok(msg) => {
                let line = format_received(&msg.channel, &msg.frame);
                broadcast_line(&peers, &line).await;
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                warn!("rebroadcast fell behind; {n} message(s) dropped");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Sends one line to every peer active at call time.
///
/// Snapshots the sinks under the lock, then sends without it; a send that
/// races an eviction fails and is ignored.
async fn broadcast_line(peers: &PeerMap, line: &str) {
    let sinks: Vec<mpsc::UnboundedSender<String>> = {
        let peers = peers.lock().await;
        peers.values().map(|p| p.outbound.clone()).collect()
    };
    for sink in sinks {
        let _ = sink.send(line.to_string());
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
