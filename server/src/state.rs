//! # Server State
//!
//! Holds the shared application state for the relay server:
//! - **Session registry**: maps short session ids to live sessions
//! - **Session**: one shared PTY — at most one agent channel, any number of
//!   viewer channels, and a rolling scrollback buffer for late joiners
//!
//! The registry uses [`DashMap`] for concurrent access across handler
//! tasks; everything mutable inside a session sits behind a single
//! per-session lock. Channel handles stored here are unbounded mpsc
//! senders feeding each connection's outbound writer task, so pushing a
//! frame never awaits and is safe under the session lock.

use dashmap::DashMap;
use hyprshare_protocol::WsMessage;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, Mutex};
use tracing::info;
use uuid::Uuid;

/// Rolling scrollback cap per session.
pub const SCROLLBACK_BYTES: usize = 64 * 1024;

/// How long a session stays addressable after its agent disconnects.
pub const SESSION_TTL_AFTER_DISCONNECT: Duration = Duration::from_secs(120);

/// Type alias for the unbounded sender used to push frames onto a
/// connection's outbound WebSocket queue. Each connected client gets one.
pub type ClientTx = mpsc::UnboundedSender<WsMessage>;

/// Generates an opaque session id: 10 lowercase hex characters drawn from
/// a UUIDv4, so ids are unguessable and unique for the process lifetime.
pub fn generate_session_id() -> String {
    Uuid::new_v4().simple().to_string()[..10].to_string()
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Session summary returned by `GET /api/sessions`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub name: String,
    pub created: u64,
    pub alive: bool,
    pub viewers: usize,
}

/// Mutable interior of a session. Guarded by one lock; all operations on
/// it are queue pushes or buffer edits, never socket I/O.
struct SessionInner {
    agent: Option<ClientTx>,
    viewers: HashMap<Uuid, ClientTx>,
    buf: Vec<u8>,
    cols: u16,
    rows: u16,
    alive: bool,
}

/// One shared terminal: a single agent channel fanning out to a set of
/// viewer channels, plus the scrollback needed to catch late joiners up.
pub struct Session {
    pub id: String,
    pub name: String,
    pub created: u64,
    inner: Mutex<SessionInner>,
}

impl Session {
    fn new(id: String, name: String, rows: u16, cols: u16) -> Self {
        Self {
            id,
            name,
            created: unix_now_secs(),
            inner: Mutex::new(SessionInner {
                agent: None,
                viewers: HashMap::new(),
                buf: Vec::new(),
                cols,
                rows,
                alive: true,
            }),
        }
    }

    /// Install the agent's outbound queue. Called once, right after the
    /// registration handshake.
    pub async fn attach_agent(&self, tx: ClientTx) {
        let mut inner = self.inner.lock().await;
        inner.agent = Some(tx);
        inner.alive = true;
    }

    // ── Scrollback ──────────────────────────────────────────────────

    /// Record one chunk of PTY output and fan it out to the viewers, as
    /// one atomic step. A viewer joining concurrently either sees the
    /// chunk in its replay (join won the lock) or as a live frame (join
    /// lost it) — never both, never neither.
    ///
    /// The buffer trim is byte-level; replay decoding tolerates a torn
    /// UTF-8 sequence at the head.
    pub async fn publish_output(&self, text: &str) {
        let mut inner = self.inner.lock().await;
        inner.buf.extend_from_slice(text.as_bytes());
        if inner.buf.len() > SCROLLBACK_BYTES {
            let excess = inner.buf.len() - SCROLLBACK_BYTES;
            inner.buf.drain(..excess);
        }
        broadcast_locked(
            &mut inner,
            &WsMessage::Output {
                data: text.to_string(),
            },
        );
    }

    /// Current scrollback, decoded with replacement characters.
    pub async fn scrollback_text(&self) -> String {
        let inner = self.inner.lock().await;
        String::from_utf8_lossy(&inner.buf).into_owned()
    }

    // ── Routing ─────────────────────────────────────────────────────

    /// Queue a frame for every viewer; viewers whose connection is gone
    /// (closed queue) are dropped from the set. Best-effort, at-most-once.
    pub async fn broadcast_to_viewers(&self, msg: WsMessage) {
        let mut inner = self.inner.lock().await;
        broadcast_locked(&mut inner, &msg);
    }

    /// Forward a frame to the agent. Returns false when the agent is
    /// detached or its queue has closed.
    pub async fn send_to_agent(&self, msg: WsMessage) -> bool {
        let inner = self.inner.lock().await;
        if !inner.alive {
            return false;
        }
        match &inner.agent {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    /// Add a viewer: queue the scrollback replay and a metadata snapshot,
    /// then insert it into the fan-out set. All three happen in one
    /// critical section — fan-out only reaches viewers already in the set,
    /// so no live frame can be queued ahead of the replay.
    pub async fn join_viewer(&self, viewer_id: Uuid, tx: ClientTx) {
        let mut inner = self.inner.lock().await;
        let replay = String::from_utf8_lossy(&inner.buf).into_owned();
        let _ = tx.send(WsMessage::Output { data: replay });
        inner.viewers.insert(viewer_id, tx.clone());
        let _ = tx.send(self.meta_locked(&inner));
    }

    pub async fn remove_viewer(&self, viewer_id: &Uuid) {
        let mut inner = self.inner.lock().await;
        inner.viewers.remove(viewer_id);
    }

    /// Record new dimensions from a viewer. Returns whether the agent is
    /// still attached; when it is not, the caller neither forwards the
    /// resize nor broadcasts fresh metadata.
    pub async fn apply_resize(&self, rows: u16, cols: u16) -> bool {
        let mut inner = self.inner.lock().await;
        inner.rows = rows;
        inner.cols = cols;
        inner.alive
    }

    /// Flip the session to detached: clear the agent channel and notify
    /// every viewer once. Idempotent — repeated calls return false and
    /// send nothing, so at most one `disconnect` frame ever goes out.
    pub async fn mark_disconnected(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.alive {
            return false;
        }
        inner.alive = false;
        inner.agent = None;
        let msg = WsMessage::Disconnect {
            message: format!("Agent '{}' disconnected", self.name),
        };
        broadcast_locked(&mut inner, &msg);
        true
    }

    // ── Introspection ───────────────────────────────────────────────

    pub async fn is_alive(&self) -> bool {
        self.inner.lock().await.alive
    }

    pub async fn viewer_count(&self) -> usize {
        self.inner.lock().await.viewers.len()
    }

    pub async fn meta(&self) -> WsMessage {
        let inner = self.inner.lock().await;
        self.meta_locked(&inner)
    }

    fn meta_locked(&self, inner: &SessionInner) -> WsMessage {
        WsMessage::Meta {
            name: self.name.clone(),
            viewers: inner.viewers.len(),
            cols: inner.cols,
            rows: inner.rows,
        }
    }

    pub async fn summary(&self) -> SessionSummary {
        let inner = self.inner.lock().await;
        SessionSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            created: self.created,
            alive: inner.alive,
            viewers: inner.viewers.len(),
        }
    }
}

fn broadcast_locked(inner: &mut SessionInner, msg: &WsMessage) {
    let dead: Vec<Uuid> = inner
        .viewers
        .iter()
        .filter(|(_, tx)| tx.send(msg.clone()).is_err())
        .map(|(id, _)| *id)
        .collect();
    for id in dead {
        inner.viewers.remove(&id);
    }
}

/// Shared application state, cloned and passed to each request handler.
#[derive(Clone)]
pub struct AppState {
    /// Registry of sessions, keyed by session id.
    pub sessions: Arc<DashMap<String, Arc<Session>>>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Mint an id, create the session, insert it into the registry.
    pub fn create_session(&self, name: String, rows: u16, cols: u16) -> Arc<Session> {
        let sid = generate_session_id();
        let sess = Arc::new(Session::new(sid.clone(), name, rows, cols));
        self.sessions.insert(sid, Arc::clone(&sess));
        sess
    }

    pub fn get_session(&self, sid: &str) -> Option<Arc<Session>> {
        self.sessions.get(sid).map(|entry| Arc::clone(entry.value()))
    }

    pub fn all_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// After the disconnect TTL elapses, remove the id — but only if it
    /// still resolves to a detached session. Ids are never reused, so the
    /// check only guards against a session that was already removed.
    pub fn schedule_prune(&self, sid: String) {
        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            tokio::time::sleep(SESSION_TTL_AFTER_DISCONNECT).await;
            let dead = match sessions.get(&sid) {
                Some(entry) => {
                    let sess = Arc::clone(entry.value());
                    drop(entry);
                    !sess.is_alive().await
                }
                None => false,
            };
            if dead {
                sessions.remove(&sid);
                info!("Session pruned: {}", sid);
            }
        });
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
