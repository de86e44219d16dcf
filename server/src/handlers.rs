//! # WebSocket Handlers
//!
//! Contains the core WebSocket logic for the relay server:
//! - Upgrading HTTP connections to WebSocket
//! - The agent channel: registration handshake, then PTY output fan-out
//! - The viewer channel: scrollback replay, then input/resize/ping routing
//! - Cleanup when either side of a session goes away
//!
//! Every connection follows the same shape: split the socket, spawn an
//! outbound task that drains a per-connection queue and serializes each
//! frame to JSON text, and process inbound frames on the handler task.
//! Routing between connections only ever touches the queues, never the
//! sockets, so no session lock is held across socket I/O.

use crate::state::{AppState, ClientTx, Session};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use hyprshare_protocol::{WsMessage, SERVER_URL_TOKEN};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// How long the agent has to send its `register` frame.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Cap on a single inbound WebSocket message.
const MAX_INBOUND_BYTES: usize = 10 * 1024 * 1024;

/// Close code used when the registration handshake is violated.
const CLOSE_PROTOCOL_ERROR: u16 = 4000;

type WsSink = Arc<tokio::sync::Mutex<SplitSink<WebSocket, Message>>>;

// ─── Upgrade Endpoints ──────────────────────────────────────────

/// `GET /agent/ws` — channel for the machine that shares its terminal.
pub async fn agent_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.max_message_size(MAX_INBOUND_BYTES)
        .on_upgrade(move |socket| handle_agent(socket, state))
}

/// `GET /viewer/ws/{sid}` — channel for a browser watching a session.
pub async fn viewer_ws_handler(
    ws: WebSocketUpgrade,
    Path(sid): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.max_message_size(MAX_INBOUND_BYTES)
        .on_upgrade(move |socket| handle_viewer(socket, sid, state))
}

// ─── Outbound Writer Task ───────────────────────────────────────

/// Spawns the task that drains a connection's outbound queue and sends
/// each frame as a JSON text frame. Stops when the queue closes or the
/// socket rejects a write.
fn spawn_outbound(sink: WsSink, mut rx: mpsc::UnboundedReceiver<WsMessage>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(t) => t,
                Err(e) => {
                    error!("Serialize error: {}", e);
                    continue;
                }
            };
            let mut sink = sink.lock().await;
            if sink.send(Message::Text(text.into())).await.is_err() {
                break; // WebSocket closed; stop sending
            }
        }
    })
}

// ─── Agent Connection ───────────────────────────────────────────

/// Manages the full lifecycle of an agent connection.
///
/// ## Flow:
/// 1. Wait (bounded) for the `register` handshake frame
/// 2. Create the session and reply with its id and templated share URL
/// 3. Relay loop: `output` → scrollback + viewer fan-out, `pong` → fan-out
/// 4. On disconnect: mark the session dead and schedule pruning
async fn handle_agent(socket: WebSocket, state: AppState) {
    let (ws_sink, mut ws_stream) = socket.split();
    let ws_sink: WsSink = Arc::new(tokio::sync::Mutex::new(ws_sink));

    // ── Registration Handshake ──
    // The first frame must be a `register` within the timeout; anything
    // else is a protocol violation and closes the channel.
    let first = tokio::time::timeout(REGISTER_TIMEOUT, ws_stream.next()).await;
    let register = match first {
        Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str::<WsMessage>(text.as_str()).ok(),
        _ => None,
    };
    let (name, rows, cols) = match register {
        Some(WsMessage::Register {
            name, rows, cols, ..
        }) => (name, rows, cols),
        _ => {
            warn!("Agent failed registration handshake");
            let mut sink = ws_sink.lock().await;
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_PROTOCOL_ERROR,
                    reason: "expected register frame".into(),
                })))
                .await;
            return;
        }
    };

    let sess = state.create_session(name, rows, cols);

    // Outbound queue for this connection; the session stores the sender
    // so viewer handlers can route input/resize/ping to the agent.
    let (tx, rx) = mpsc::unbounded_channel::<WsMessage>();
    let outbound_task = spawn_outbound(Arc::clone(&ws_sink), rx);
    sess.attach_agent(tx.clone()).await;

    // The URL is templated: the agent substitutes the token with the
    // server URL it was configured with before showing it to the user.
    let _ = tx.send(WsMessage::Session {
        sid: sess.id.clone(),
        url: format!("{SERVER_URL_TOKEN}/s/{}", sess.id),
    });
    info!("Agent registered: {:?} sid={}", sess.name, sess.id);

    // ── Relay Loop ──
    // Only `output` and `pong` are meaningful from the agent; malformed
    // or unexpected frames are ignored, never fatal.
    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => {
                let Ok(ws_msg) = serde_json::from_str::<WsMessage>(text.as_str()) else {
                    continue;
                };
                match ws_msg {
                    WsMessage::Output { data } => {
                        sess.publish_output(&data).await;
                    }
                    WsMessage::Pong => {
                        sess.broadcast_to_viewers(WsMessage::Pong).await;
                    }
                    _ => {}
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // ── Cleanup on Disconnect ──
    outbound_task.abort();
    if sess.mark_disconnected().await {
        info!("Agent disconnected: {:?} sid={}", sess.name, sess.id);
        state.schedule_prune(sess.id.clone());
    }
}

// ─── Viewer Connection ──────────────────────────────────────────

/// Manages the full lifecycle of a viewer connection.
///
/// ## Flow:
/// 1. Resolve the session id; unknown/expired → one `error` frame, close
/// 2. Join the session (scrollback replay, then a `meta` snapshot)
/// 3. Loop: `ping`/`input`/`resize` routed toward the agent
/// 4. On disconnect: leave the viewer set
async fn handle_viewer(mut socket: WebSocket, sid: String, state: AppState) {
    let Some(sess) = state.get_session(&sid) else {
        let err = WsMessage::Error {
            message: format!("Session '{sid}' not found or expired."),
        };
        if let Ok(text) = serde_json::to_string(&err) {
            let _ = socket.send(Message::Text(text.into())).await;
        }
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    let (ws_sink, mut ws_stream) = socket.split();
    let ws_sink: WsSink = Arc::new(tokio::sync::Mutex::new(ws_sink));
    let (tx, rx) = mpsc::unbounded_channel::<WsMessage>();
    let outbound_task = spawn_outbound(Arc::clone(&ws_sink), rx);

    let viewer_id = Uuid::new_v4();
    sess.join_viewer(viewer_id, tx.clone()).await;
    info!(
        "Viewer joined: sid={} total={}",
        sid,
        sess.viewer_count().await
    );

    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => {
                let Ok(ws_msg) = serde_json::from_str::<WsMessage>(text.as_str()) else {
                    continue;
                };
                handle_viewer_message(&sess, &tx, ws_msg).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    sess.remove_viewer(&viewer_id).await;
    outbound_task.abort();
    info!(
        "Viewer left: sid={} total={}",
        sid,
        sess.viewer_count().await
    );
}

/// Routes a single frame from a viewer.
async fn handle_viewer_message(sess: &Arc<Session>, tx: &ClientTx, msg: WsMessage) {
    match msg {
        // ── Latency Probe ──
        // Forwarded to the agent, whose `pong` is fanned back out. With
        // the agent gone the server answers directly so the viewer's
        // latency display keeps working.
        WsMessage::Ping => {
            if !sess.send_to_agent(WsMessage::Ping).await {
                let _ = tx.send(WsMessage::Pong);
            }
        }

        // ── Keystrokes ──
        // Dropped silently when the agent is detached.
        WsMessage::Input { data } => {
            sess.send_to_agent(WsMessage::Input { data }).await;
        }

        // ── Resize ──
        // First-writer-wins across viewers. The new dimensions are
        // recorded either way; forwarding and the `meta` broadcast only
        // happen while the agent is attached.
        WsMessage::Resize { rows, cols } => {
            if sess.apply_resize(rows, cols).await {
                sess.send_to_agent(WsMessage::Resize { rows, cols }).await;
                let meta = sess.meta().await;
                sess.broadcast_to_viewers(meta).await;
            }
        }

        _ => {}
    }
}
