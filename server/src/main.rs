//! # HyprShare Relay Server
//!
//! A WebSocket-based relay that shares a terminal with any browser. A
//! machine runs the **agent**, which bridges a local PTY to this server;
//! the server assigns a short session id and any number of **viewers**
//! watch (and type into) the session at `/s/{sid}`.
//!
//! ## Architecture
//!
//! ```text
//! Shell ──PTY──► Agent ──WS──► Relay Server ──WS──► Viewers (browser)
//! ```
//!
//! ## Modules
//!
//! - [`state`]    — Session registry, scrollback, lifecycle
//! - [`handlers`] — WebSocket connection lifecycle and message routing
//! - [`api`]      — REST API endpoints
//! - [`pages`]    — Dashboard/viewer pages and the shell installer

mod api;
mod handlers;
mod pages;
#[cfg(test)]
mod relay_tests;
mod state;

use axum::{routing::get, Router};
use clap::Parser;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::state::AppState;

/// HyprShare — self-hosted terminal sharing server.
#[derive(Parser, Debug)]
#[command(name = "hyprshare-server", version, about)]
struct Args {
    /// Bind address
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Bind port
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Dev-mode auto-reload (accepted for CLI parity; no effect here)
    #[arg(long)]
    reload: bool,
}

/// Server entry point.
///
/// Initializes logging, creates the shared state, configures routes,
/// prints the startup banner, and starts listening.
#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Structured logging with env-filter support. Default log level is
    // `info` for this crate; override with the RUST_LOG variable.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hyprshare_server=info".into()),
        )
        .init();

    if args.reload {
        warn!("--reload has no effect in the compiled server");
    }

    let app = build_router(AppState::new());

    print_banner(args.port);

    let listener = tokio::net::TcpListener::bind((args.host.as_str(), args.port))
        .await
        .unwrap();
    info!("HyprShare listening on {}:{}", args.host, args.port);
    axum::serve(listener, app).await.unwrap();
}

/// All routes of the HTTP/WebSocket surface over the given state.
fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(pages::dashboard))
        .route("/s/{sid}", get(pages::viewer_page))
        .route("/get", get(pages::installer))
        .route("/agent.py", get(pages::agent_script))
        .route("/api/sessions", get(api::list_sessions))
        .route("/agent/ws", get(handlers::agent_ws_handler))
        .route("/viewer/ws/{sid}", get(handlers::viewer_ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Best-effort LAN address for the install one-liner. The UDP connect
/// never sends a packet; it only selects the outbound interface.
fn local_ip() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect("8.8.8.8:80")?;
            s.local_addr()
        })
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn print_banner(port: u16) {
    let ip = local_ip();
    println!();
    println!("  ⚡ HyprShare");
    println!();
    println!("  Dashboard   http://localhost:{port}/");
    println!();
    println!("  Share a terminal from any machine:");
    println!("    curl -sSf http://{ip}:{port}/get | sh -s run");
    println!();
}
