//! NAMO serial bridge server entry point.
//!
//! Wires together the configuration, the bridge with one link session per
//! configured serial channel, and the TCP hub, then runs until Ctrl-C.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load_config()        -- TOML file, defaults when absent
//!  └─ Bridge::new()        -- one LinkSession task per channel
//!  └─ TcpHub::bind().run() -- accept loop + heartbeat sweep + rebroadcast
//! ```

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use namo_server::application::bridge::Bridge;
use namo_server::domain::config::load_config;
use namo_server::infrastructure::link::LinkConfig;
use namo_server::infrastructure::serial::{available_ports, SerialLinkTransport};
use namo_server::infrastructure::tcp_hub::{HubConfig, TcpHub};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging.  Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("NAMO serial server starting");

    // ── Configuration ─────────────────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("namo.toml"));
    let config = load_config(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let ports = available_ports();
    if ports.is_empty() {
        info!("no serial ports detected on this system");
    } else {
        info!("available serial ports: {}", ports.join(", "));
    }

    // ── Bridge and link sessions ──────────────────────────────────────────────
    let link_config = LinkConfig {
        reconnect_delay: config.timing.reconnect_delay(),
        read_stall: config.timing.read_stall(),
        limits: config.limits.frame_limits(),
    };
    let mut bridge = Bridge::new(link_config);

    for entry in &config.channels {
        info!(
            "opening channel: {}, baud={}, line={}",
            entry.name, entry.baud, entry.line
        );
        // An invalid descriptor is fatal only to this channel; the rest
        // of the bridge comes up regardless.
        match entry.settings() {
            Ok(settings) => {
                bridge.add_channel(settings.name.clone(), Arc::new(SerialLinkTransport::new(settings)));
            }
            Err(e) => {
                error!("skipping channel {}: {e}", entry.name);
            }
        }
    }
    let bridge = Arc::new(bridge);

    // ── Shutdown flag and Ctrl-C handler ──────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            running_clone.store(false, Ordering::Relaxed);
        }
    });

    // ── TCP hub ───────────────────────────────────────────────────────────────
    let hub_config = HubConfig {
        listen_addr: config
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen_addr {:?}", config.listen_addr))?,
        heartbeat_interval: config.timing.heartbeat_interval(),
        peer_timeout: config.timing.peer_timeout(),
    };

    let hub = TcpHub::bind(hub_config, Arc::clone(&bridge), Arc::clone(&running)).await?;
    if let Err(e) = hub.run().await {
        warn!("hub stopped with error: {e:#}");
    }

    bridge.shutdown();
    info!("NAMO serial server stopped");
    Ok(())
}
