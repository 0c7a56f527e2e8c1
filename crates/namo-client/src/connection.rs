//! TCP connection management for the remote client.
//!
//! Architecture:
//! - `RemoteClient` owns an outbound command queue and a reconnect loop.
//! - Per connection, three concerns run concurrently and the session ends
//!   as soon as any of them fails:
//!   - **send pump**: drains queued commands onto the socket;
//!   - **receive pump**: parses inbound lines; heartbeat probes refresh
//!     the liveness timestamp, publish lines are delivered as events;
//!   - **watchdog**: sends a heartbeat on a fixed interval and treats a
//!     stale heartbeat response as a dead connection.
//! - On loss, the loop retries with exponential backoff (doubling from
//!   the initial delay up to a cap) and optionally gives up permanently
//!   after a configured number of consecutive failures.
//!
//! Commands may be queued at any time; they survive reconnects and are
//! flushed once a connection is up (messages in flight when a connection
//! drops may be lost; the protocol is at-most-once end to end).

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, timeout};
use tracing::{debug, error, info, warn};

use namo_core::protocol::command::{encode_hex, RECEIVED_PREFIX};
use namo_core::Command;

/// Configuration for the client's connection to the server.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address, `host:port`.
    pub server_addr: String,
    /// Bound on each TCP connect attempt.
    pub connect_timeout: Duration,
    /// Silence threshold: no heartbeat response within this window is
    /// treated as a dead connection.
    pub socket_timeout: Duration,
    /// Interval between heartbeats sent to the server.
    pub heartbeat_interval: Duration,
    /// The heartbeat literal exchanged with the server.
    pub heartbeat_line: String,
    /// First reconnect delay after a failure.
    pub initial_reconnect_delay: Duration,
    /// Cap for the exponentially growing reconnect delay.
    pub max_reconnect_delay: Duration,
    /// Consecutive failed attempts before giving up permanently;
    /// `0` retries forever.
    pub max_reconnect_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:9000".to_string(),
            connect_timeout: Duration::from_millis(5000),
            socket_timeout: Duration::from_millis(8000),
            heartbeat_interval: Duration::from_millis(1200),
            heartbeat_line: "HEARTBEAT".to_string(),
            initial_reconnect_delay: Duration::from_millis(1000),
            max_reconnect_delay: Duration::from_millis(2000),
            max_reconnect_attempts: 0,
        }
    }
}

/// Events emitted by the connection to the application layer.
#[derive(Debug, PartialEq, Eq)]
pub enum ClientEvent {
    /// The TCP connection was established.
    Connected { addr: String },
    /// The TCP connection was lost; reconnection is in progress.
    Disconnected,
    /// A `RECEIVED …` publish line arrived from the server.
    Received(String),
    /// Any other server line (banner, confirmations, errors).
    ServerLine(String),
    /// The configured attempt limit was reached; the client stopped.
    GaveUp,
}

/// Manages the TCP connection from the client to the serial server.
pub struct RemoteClient {
    config: ClientConfig,
    outbound_tx: mpsc::UnboundedSender<Command>,
    // Taken by `start`; held here so commands can be queued before the
    // connection loop is running.
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
}

impl RemoteClient {
    /// Creates a new (not yet connected) client.
    pub fn new(config: ClientConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            config,
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
        }
    }

    /// Queues a TEXT send command.
    pub fn send_text(
        &self,
        channel: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.send_command(Command::SendText {
            channel: channel.into(),
            key: key.into(),
            value: value.into(),
        });
    }

    /// Queues a BINARY send command; the payload travels as uppercase hex.
    pub fn send_binary(
        &self,
        channel: impl Into<String>,
        key: impl Into<String>,
        payload: Vec<u8>,
    ) {
        debug!("queueing binary command: {} bytes ({})", payload.len(), encode_hex(&payload));
        self.send_command(Command::SendBinary {
            channel: channel.into(),
            key: key.into(),
            payload,
        });
    }

    /// Queues any command for the send pump.  Never blocks; commands
    /// queued while disconnected are flushed after reconnection.
    pub fn send_command(&self, command: Command) {
        let _ = self.outbound_tx.send(command);
    }

    /// Starts the reconnect loop and returns the event receiver.
    ///
    /// The loop runs until `running` is cleared or the attempt limit is
    /// reached.  Calling `start` twice is a no-op for the second caller
    /// (the queue receiver is already taken); the first receiver stays
    /// authoritative.
    pub fn start(
        self: Arc<Self>,
        running: Arc<AtomicBool>,
    ) -> mpsc::Receiver<ClientEvent> {
        let (event_tx, event_rx) = mpsc::channel(128);

        let Some(mut out_rx) = self.outbound_rx.lock().unwrap().take() else {
            warn!("client already started; ignoring");
            return event_rx;
        };

        let this = Arc::clone(&self);
        tokio::spawn(async move {
            let config = &this.config;
            let mut attempts: u32 = 0;
            let mut delay = config.initial_reconnect_delay;

            while running.load(Ordering::Relaxed) {
                if config.max_reconnect_attempts > 0 && attempts >= config.max_reconnect_attempts {
                    error!("maximum reconnection attempts reached; giving up");
                    let _ = event_tx.send(ClientEvent::GaveUp).await;
                    return;
                }

                match timeout(
                    config.connect_timeout,
                    TcpStream::connect(&config.server_addr),
                )
                .await
                {
                    Ok(Ok(stream)) => {
                        info!("connected to server at {}", config.server_addr);
                        attempts = 0;
                        delay = config.initial_reconnect_delay;
                        let _ = event_tx
                            .send(ClientEvent::Connected {
                                addr: config.server_addr.clone(),
                            })
                            .await;

                        run_session(stream, config, &mut out_rx, &event_tx).await;

                        let _ = event_tx.send(ClientEvent::Disconnected).await;
                        warn!("connection lost; reconnecting in {delay:?}");
                    }
                    Ok(Err(e)) => {
                        attempts += 1;
                        warn!("connection attempt {attempts} failed: {e}");
                    }
                    Err(_) => {
                        attempts += 1;
                        warn!("connection attempt {attempts} timed out");
                    }
                }

                if running.load(Ordering::Relaxed) {
                    sleep(delay).await;
                    delay = (delay * 2).min(config.max_reconnect_delay);
                }
            }
        });

        event_rx
    }
}

/// Runs one established connection until any pump fails.
async fn run_session(
    stream: TcpStream,
    config: &ClientConfig,
    out_rx: &mut mpsc::UnboundedReceiver<Command>,
    event_tx: &mpsc::Sender<ClientEvent>,
) {
    let (read_half, write_half) = stream.into_split();

    // The send pump and the watchdog both write; share the half behind an
    // async mutex the way the hub shares its sinks.
    let writer = Arc::new(tokio::sync::Mutex::new(write_half));
    // Refreshed by the receive pump, read by the watchdog.
    let last_heartbeat_rx = Arc::new(Mutex::new(Instant::now()));

    let send_pump = send_pump(Arc::clone(&writer), out_rx);
    let receive_pump = receive_pump(read_half, config, Arc::clone(&last_heartbeat_rx), event_tx);
    let watchdog = heartbeat_watchdog(Arc::clone(&writer), config, last_heartbeat_rx);

    tokio::select! {
        _ = send_pump => debug!("send pump ended"),
        _ = receive_pump => debug!("receive pump ended"),
        _ = watchdog => debug!("heartbeat watchdog ended"),
    }
}

/// Drains the outbound command queue onto the socket.
async fn send_pump(
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    out_rx: &mut mpsc::UnboundedReceiver<Command>,
) {
    while let Some(command) = out_rx.recv().await {
        let line = format!("{command}\n");
        let mut writer = writer.lock().await;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            warn!("failed to send command: {e}");
            return;
        }
        debug!("sent: {}", line.trim_end());
    }
}

/// Parses inbound server lines until EOF or a read error.
async fn receive_pump(
    read_half: OwnedReadHalf,
    config: &ClientConfig,
    last_heartbeat_rx: Arc<Mutex<Instant>>,
    event_tx: &mpsc::Sender<ClientEvent>,
) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("server closed the connection");
                return;
            }
            Err(e) => {
                warn!("read from server failed: {e}");
                return;
            }
        };

        if line == config.heartbeat_line {
            *last_heartbeat_rx.lock().unwrap() = Instant::now();
            continue;
        }

        let event = if line.starts_with(RECEIVED_PREFIX) {
            ClientEvent::Received(line)
        } else {
            ClientEvent::ServerLine(line)
        };
        if event_tx.send(event).await.is_err() {
            // The application dropped the event receiver; stop the session.
            return;
        }
    }
}

/// Sends a heartbeat on a fixed interval and fails the session when the
/// server has been silent past the socket timeout.
async fn heartbeat_watchdog(
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    config: &ClientConfig,
    last_heartbeat_rx: Arc<Mutex<Instant>>,
) {
    let mut ticker = interval(config.heartbeat_interval);
    ticker.tick().await; // Skip the immediate first tick.

    loop {
        ticker.tick().await;

        let silent_for = last_heartbeat_rx.lock().unwrap().elapsed();
        if silent_for > config.socket_timeout {
            warn!("no heartbeat response from server for {silent_for:?}; reconnecting");
            return;
        }

        let line = format!("{}\n", config.heartbeat_line);
        let mut writer = writer.lock().await;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            warn!("failed to send heartbeat: {e}");
            return;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
