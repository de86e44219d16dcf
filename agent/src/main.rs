//! # HyprShare Agent
//!
//! Runs on the machine whose shell you want to share. Spawns a real PTY
//! shell and relays its I/O to the HyprShare server over a WebSocket,
//! reconnecting with exponential backoff when the link drops. Each
//! (re)connection registers a brand-new session with its own id.
//!
//! ```text
//! Shell ──PTY──► agent ──WS──► server ──WS──► browser viewers
//! ```

mod pty;
mod session;

use clap::Parser;
use std::time::Duration;
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{error, warn};

/// Cap on a single inbound WebSocket message.
const MAX_INBOUND_BYTES: usize = 10 * 1024 * 1024;

/// Reconnect backoff: start here…
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(2);
/// …multiply by this after every failed round…
const RETRY_MULTIPLIER: f64 = 1.5;
/// …and never wait longer than this.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// HyprShare agent — share this terminal over the web.
#[derive(Parser, Debug)]
#[command(name = "hyprshare", version, about)]
struct Args {
    /// HyprShare server URL, e.g. http://192.168.1.20:8000
    #[arg(long, value_name = "URL")]
    server: String,

    /// Exit immediately on disconnect instead of retrying
    #[arg(long)]
    no_reconnect: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hyprshare_agent=info".into()),
        )
        .init();

    // Ctrl+C is the one way to stop on purpose; everything else retries.
    tokio::select! {
        _ = run(&args) => {}
        _ = tokio::signal::ctrl_c() => {
            println!("\n[hyprshare] Stopped.");
        }
    }
}

/// Connect → session → backoff, forever (or once with `--no-reconnect`).
async fn run(args: &Args) {
    let (server, ws_url) = derive_ws_url(&args.server);
    println!("[hyprshare] Connecting to {server} ...");

    let mut retry_delay = INITIAL_RETRY_DELAY;

    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_INBOUND_BYTES);
    config.max_frame_size = Some(MAX_INBOUND_BYTES);

    loop {
        match connect_async_with_config(&ws_url, Some(config), false).await {
            Ok((ws, _)) => {
                retry_delay = INITIAL_RETRY_DELAY; // reset on successful connect
                if let Err(e) = session::run_session(ws, &server).await {
                    warn!("Session ended: {e:#}");
                }
            }
            Err(e) => {
                error!("Connection failed: {e}");
            }
        }

        if args.no_reconnect {
            println!("[hyprshare] Disconnected.");
            return;
        }

        println!(
            "[hyprshare] Reconnecting in {}s ...",
            retry_delay.as_secs()
        );
        tokio::time::sleep(retry_delay).await;
        retry_delay = Duration::from_secs_f64(
            (retry_delay.as_secs_f64() * RETRY_MULTIPLIER).min(MAX_RETRY_DELAY.as_secs_f64()),
        );
    }
}

/// Normalize the configured server URL and derive the agent's WebSocket
/// endpoint from it: `http` becomes `ws`, `https` becomes `wss`.
fn derive_ws_url(server_url: &str) -> (String, String) {
    let server = server_url.trim_end_matches('/').to_string();
    let ws_url = if let Some(rest) = server.strip_prefix("https://") {
        format!("wss://{rest}/agent/ws")
    } else if let Some(rest) = server.strip_prefix("http://") {
        format!("ws://{rest}/agent/ws")
    } else {
        format!("ws://{server}/agent/ws")
    };
    (server, ws_url)
}
