//! Development relay for voice channels.
//!
//! Serves WebSocket signaling on `VOICE_RELAY_ADDR` (default 0.0.0.0:8000)
//! and the roster on `VOICE_ROSTER_ADDR` (default 0.0.0.0:8001).
//!
//! Usage:
//!   RUST_LOG=debug cargo run --bin voice-relay

use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use stacknote_voice::{RosterEndpoint, SignalingRelay};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let relay_addr = std::env::var("VOICE_RELAY_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string());
    let roster_addr = std::env::var("VOICE_ROSTER_ADDR").unwrap_or_else(|_| "0.0.0.0:8001".to_string());

    let relay = match SignalingRelay::bind(&relay_addr).await {
        Ok(relay) => relay,
        Err(e) => {
            log::error!("Failed to bind signaling relay on {}: {}", relay_addr, e);
            std::process::exit(1);
        }
    };

    let roster_addr: SocketAddr = match roster_addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            log::error!("Invalid VOICE_ROSTER_ADDR {}: {}", roster_addr, e);
            std::process::exit(1);
        }
    };
    let mut roster = RosterEndpoint::new(relay.roster_source());
    if let Err(e) = roster.start(roster_addr).await {
        log::error!("{}", e);
        std::process::exit(1);
    }

    let running = relay.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Stopping...");
            running.store(false, Ordering::SeqCst);
        }
    });

    relay.run().await;
    roster.stop();
}
