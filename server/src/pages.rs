//! # Pages & Installer
//!
//! The non-WebSocket HTTP surface: dashboard page, viewer page, the shell
//! installer (rendered per request with the server URL baked in), and the
//! downloadable agent script the installer fetches.

use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
};

const DASHBOARD_HTML: &str = include_str!("../assets/dashboard.html");
const VIEWER_HTML: &str = include_str!("../assets/viewer.html");

/// `GET /` — Dashboard page.
pub async fn dashboard() -> Html<&'static str> {
    Html(DASHBOARD_HTML)
}

/// `GET /s/{sid}` — Viewer page for one session; 404 for unknown ids.
pub async fn viewer_page(Path(sid): Path<String>, State(state): State<AppState>) -> Response {
    if state.get_session(&sid).is_none() {
        return (
            StatusCode::NOT_FOUND,
            format!("Session '{sid}' not found"),
        )
            .into_response();
    }
    Html(VIEWER_HTML.replace("{{SID}}", &sid)).into_response()
}

/// `GET /get` — Shell installer script with the server URL baked in.
///
/// The base URL is reconstructed from the request: `Host` header plus the
/// `x-forwarded-proto` scheme a TLS-terminating proxy would set.
pub async fn installer(headers: HeaderMap) -> String {
    render_installer(&base_url(&headers))
}

/// `GET /agent.py` — The agent script, served from a file next to the
/// server binary (or the working directory); 404 when absent.
pub async fn agent_script() -> Response {
    match read_agent_asset().await {
        Some(text) => text.into_response(),
        None => (
            StatusCode::NOT_FOUND,
            "agent.py not found next to the server binary",
        )
            .into_response(),
    }
}

fn base_url(headers: &HeaderMap) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost:8000");
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    format!("{scheme}://{host}")
}

async fn read_agent_asset() -> Option<String> {
    let mut candidates = Vec::new();
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            candidates.push(dir.join("agent.py"));
        }
    }
    candidates.push(std::path::PathBuf::from("agent.py"));

    for path in candidates {
        if let Ok(text) = tokio::fs::read_to_string(&path).await {
            return Some(text);
        }
    }
    None
}

fn render_installer(server_url: &str) -> String {
    format!(
        r#"#!/bin/sh
# HyprShare — agent installer
# Usage:
#   curl -sSf {server_url}/get | sh           # download & install
#   curl -sSf {server_url}/get | sh -s run    # download & run immediately
set -e

SERVER_URL="{server_url}"
INSTALL_DIR="$HOME/.local/bin"
BINARY="$INSTALL_DIR/hyprshare"

# ── detect python ────────────────────────────────────────────────────────────
PYTHON=""
for cmd in python3 python; do
  if command -v "$cmd" >/dev/null 2>&1; then
    PYTHON="$cmd"
    break
  fi
done
[ -z "$PYTHON" ] && {{ echo "[hyprshare] ERROR: python3 not found" >&2; exit 1; }}

# ── install websockets (silent, best effort) ─────────────────────────────────
$PYTHON -m pip install --quiet websockets 2>/dev/null || true

# ── download the agent ───────────────────────────────────────────────────────
mkdir -p "$INSTALL_DIR"
echo "[hyprshare] Downloading agent ..."
if   command -v curl >/dev/null 2>&1; then curl -sSf "$SERVER_URL/agent.py" -o "$BINARY"
elif command -v wget >/dev/null 2>&1; then wget  -q   "$SERVER_URL/agent.py" -O "$BINARY"
else {{ echo "[hyprshare] ERROR: curl or wget required" >&2; exit 1; }}
fi
chmod +x "$BINARY"
echo "[hyprshare] Installed -> $BINARY"

# ── run immediately when invoked as: sh -s run ───────────────────────────────
if [ "$1" = "run" ]; then
  exec $PYTHON "$BINARY" --server "$SERVER_URL"
fi

echo ""
echo "  Start a session:"
echo "    $PYTHON $BINARY --server $SERVER_URL"
echo ""
"#
    )
}
