//! # One Connected Session
//!
//! Everything that happens between a successful WebSocket connect and the
//! teardown of the PTY: the registration handshake, the user-facing
//! banner, and the two relay directions (PTY output → server, server
//! input/resize/ping → PTY) plus the local-resize signal handler and the
//! transport heartbeat.

use crate::pty::{self, ResizeSender};
use anyhow::{bail, Context, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use hyprshare_protocol::{WsMessage, SERVER_URL_TOKEN};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Transport-level keepalive: one WebSocket ping per interval…
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
/// …and the connection is considered dead when a pong is this overdue.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the server gets to answer `register` with `session`.
const SESSION_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsTx = mpsc::UnboundedSender<Message>;

/// Local terminal size as (rows, cols); falls back to 24×220 when there
/// is no controlling terminal (e.g. started from a service manager).
fn terminal_size() -> (u16, u16) {
    match crossterm::terminal::size() {
        Ok((cols, rows)) => (rows.max(24), cols.max(80)),
        Err(_) => (24, 220),
    }
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn preferred_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())
}

/// Serialize a protocol frame for the outbound queue.
fn frame(msg: &WsMessage) -> Option<Message> {
    serde_json::to_string(msg).ok().map(|t| Message::Text(t.into()))
}

/// Register with the server, spawn the PTY shell, and relay I/O until
/// either direction ends. A clean return still means the caller should
/// reconnect (a fresh session id will be issued); an error is reported
/// and handled the same way.
pub async fn run_session(ws: WsStream, server_url: &str) -> Result<()> {
    let (ws_sink, mut ws_stream) = ws.split();

    // Outbound queue: exactly one task writes to the socket; every other
    // participant (PTY reader, heartbeat, dispatch) just queues frames.
    let (tx, rx) = mpsc::unbounded_channel::<Message>();
    let outbound = spawn_outbound(ws_sink, rx);

    // ── Registration Handshake ──
    let (rows, cols) = terminal_size();
    let shell_path = preferred_shell();
    let register = WsMessage::Register {
        name: local_hostname(),
        shell: shell_path.clone(),
        rows,
        cols,
    };
    if let Some(msg) = frame(&register) {
        let _ = tx.send(msg);
    }

    let (sid, url) = await_session_reply(&mut ws_stream).await?;
    let view_url = url.replace(SERVER_URL_TOKEN, server_url);
    print_banner(&sid, &view_url);

    // ── PTY ──
    let (shell, mut pty_rx, resize_tx) =
        pty::spawn_shell(&shell_path, rows, cols).context("failed to spawn PTY shell")?;

    // PTY → server: each chunk becomes one lossy-decoded `output` frame.
    let tx_out = tx.clone();
    let mut pty_to_ws = tokio::spawn(async move {
        while let Some(chunk) = pty_rx.recv().await {
            let msg = WsMessage::Output {
                data: String::from_utf8_lossy(&chunk).into_owned(),
            };
            match frame(&msg) {
                Some(m) => {
                    if tx_out.send(m).is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
    });

    // Local terminal resize → PTY.
    let sigwinch = spawn_sigwinch(resize_tx.clone());

    // Transport heartbeat; completion of this task means the link is stale.
    let last_pong = Arc::new(Mutex::new(Instant::now()));
    let mut heartbeat = spawn_heartbeat(tx.clone(), Arc::clone(&last_pong));

    // ── Server → PTY ──
    let inbound = async {
        while let Some(Ok(msg)) = ws_stream.next().await {
            match msg {
                Message::Text(text) => {
                    let Ok(ws_msg) = serde_json::from_str::<WsMessage>(text.as_str()) else {
                        continue;
                    };
                    match ws_msg {
                        WsMessage::Input { data } => {
                            if shell.write_input(data.as_bytes()).is_err() {
                                break;
                            }
                        }
                        WsMessage::Resize { rows, cols } => {
                            let _ = resize_tx.send((rows, cols));
                        }
                        WsMessage::Ping => {
                            if let Some(m) = frame(&WsMessage::Pong) {
                                let _ = tx.send(m);
                            }
                        }
                        other => debug!("Ignoring frame: {:?}", other),
                    }
                }
                Message::Pong(_) => {
                    if let Ok(mut t) = last_pong.lock() {
                        *t = Instant::now();
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = inbound => {}
        _ = &mut pty_to_ws => {}
        _ = &mut heartbeat => {}
    }

    // ── Teardown ──
    shell.shutdown();
    pty_to_ws.abort();
    sigwinch.abort();
    heartbeat.abort();
    outbound.abort();
    Ok(())
}

fn spawn_outbound(
    mut ws_sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sink.send(msg).await.is_err() {
                break; // Connection lost
            }
        }
    })
}

/// Re-query the local terminal on SIGWINCH and push the new size to the
/// PTY, so a locally resized window propagates to the shared shell.
fn spawn_sigwinch(resize_tx: ResizeSender) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let Ok(mut winch) = signal(SignalKind::window_change()) else {
            return;
        };
        while winch.recv().await.is_some() {
            let (rows, cols) = terminal_size();
            if resize_tx.send((rows, cols)).is_err() {
                break;
            }
        }
    })
}

/// Sends a WebSocket ping every [`HEARTBEAT_INTERVAL`]; finishes when the
/// link stops answering (pong overdue by [`HEARTBEAT_TIMEOUT`]) or the
/// outbound queue closes.
fn spawn_heartbeat(tx: WsTx, last_pong: Arc<Mutex<Instant>>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        interval.tick().await; // first tick completes immediately
        loop {
            interval.tick().await;
            let stale = last_pong
                .lock()
                .map(|t| t.elapsed() > HEARTBEAT_INTERVAL + HEARTBEAT_TIMEOUT)
                .unwrap_or(true);
            if stale {
                warn!("Heartbeat timed out; dropping connection");
                break;
            }
            if tx.send(Message::Ping(Vec::new().into())).is_err() {
                break;
            }
        }
    })
}

/// Wait for the `session` assignment. Transport frames are skipped; any
/// other protocol frame at this point is a handshake violation.
async fn await_session_reply(ws_stream: &mut SplitStream<WsStream>) -> Result<(String, String)> {
    let reply = tokio::time::timeout(SESSION_REPLY_TIMEOUT, async {
        while let Some(frame) = ws_stream.next().await {
            let frame = frame.context("connection lost during handshake")?;
            if let Message::Text(text) = frame {
                return match serde_json::from_str::<WsMessage>(text.as_str()) {
                    Ok(WsMessage::Session { sid, url }) => Ok((sid, url)),
                    _ => bail!("unexpected server reply: {}", text.as_str()),
                };
            }
        }
        bail!("connection closed during handshake")
    })
    .await;

    match reply {
        Ok(result) => result,
        Err(_) => bail!("timed out waiting for session assignment"),
    }
}

fn print_banner(sid: &str, url: &str) {
    let sep = "─".repeat(56);
    println!();
    println!("{sep}");
    println!("  ⚡ HyprShare — Session Active");
    println!("{sep}");
    println!("  Session  {sid}");
    println!("  URL      {url}");
    println!("{sep}");
    println!("  Open the URL in any browser to view / type.");
    println!("  Press Ctrl+C to stop.");
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_size_has_sane_floor() {
        let (rows, cols) = terminal_size();
        assert!(rows >= 24);
        assert!(cols >= 80);
    }

    #[test]
    fn frames_serialize_with_type_tag() {
        let msg = frame(&WsMessage::Pong).unwrap_or_else(|| panic!("pong did not serialize"));
        match msg {
            Message::Text(text) => assert_eq!(text.as_str(), r#"{"type":"pong"}"#),
            other => panic!("expected text frame, got {other:?}"),
        }
    }
}
