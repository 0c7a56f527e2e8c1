//! Interactive NAMO client entry point.
//!
//! Connects to the serial server, prints everything the server publishes,
//! and forwards commands typed on stdin:
//!
//! ```text
//! $ namo-client 127.0.0.1:9000
//! TEXT /dev/ttyUSB0 greeting HelloWorld
//! BINARY /dev/ttyUSB0 blob DEADBEEF
//! exit
//! ```

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

use namo_client::{ClientConfig, ClientEvent, RemoteClient};
use namo_core::parse_command;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging.  Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let server_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9000".to_string());

    let client = Arc::new(RemoteClient::new(ClientConfig {
        server_addr,
        ..ClientConfig::default()
    }));
    let running = Arc::new(AtomicBool::new(true));
    let mut events = Arc::clone(&client).start(Arc::clone(&running));

    // ── Ctrl-C handler ────────────────────────────────────────────────────────
    let running_ctrlc = Arc::clone(&running);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            running_ctrlc.store(false, Ordering::Relaxed);
        }
    });

    // ── Stdin command loop ────────────────────────────────────────────────────
    println!("Enter commands in format: <TYPE> <CHANNEL> <KEY> <VALUE>");
    println!("Example: TEXT COM1 testKey HelloWorld");
    println!("         BINARY COM2 binKey DEADBEEF");
    println!("Enter 'exit' to quit");

    let stdin_client = Arc::clone(&client);
    let running_stdin = Arc::clone(&running);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line.eq_ignore_ascii_case("exit") {
                running_stdin.store(false, Ordering::Relaxed);
                break;
            }
            match parse_command(line) {
                Ok(command) => stdin_client.send_command(command),
                Err(e) => println!("Error: {e}"),
            }
        }
    });

    // ── Event loop ────────────────────────────────────────────────────────────
    while let Some(event) = events.recv().await {
        if !running.load(Ordering::Relaxed) {
            break;
        }
        match event {
            ClientEvent::Connected { addr } => println!("Connected to server: {addr}"),
            ClientEvent::Disconnected => println!("Disconnected; reconnecting…"),
            ClientEvent::Received(line) => println!("Serial message: {line}"),
            ClientEvent::ServerLine(line) => println!("Server: {line}"),
            ClientEvent::GaveUp => {
                println!("Gave up reconnecting.");
                break;
            }
        }
    }

    Ok(())
}
