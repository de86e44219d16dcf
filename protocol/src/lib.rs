//! # WebSocket Protocol Messages
//!
//! Defines all message types exchanged between the agent, the relay server
//! and browser viewers. Messages are serialized as JSON text frames using
//! serde's internally-tagged representation (`"type": "..."` field).

use serde::{Deserialize, Serialize};

/// Placeholder embedded in the `url` field of a [`WsMessage::Session`] reply.
///
/// The server cannot know its own canonical public URL (it may sit behind a
/// reverse proxy), so it emits this literal token and the agent substitutes
/// the `--server` value it already knows before displaying the share URL.
pub const SERVER_URL_TOKEN: &str = "__SERVER__";

/// All possible WebSocket messages in the terminal-sharing protocol.
///
/// The `#[serde(tag = "type")]` attribute means each variant is serialized
/// as a JSON object with a `"type"` field whose value is the snake_case
/// variant name. For example, `WsMessage::Ping` serializes to
/// `{"type": "ping"}`.
///
/// Frames that fail to deserialize (malformed JSON, unknown `type`) are
/// ignored by every consumer; they are never a fatal error.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    // ── Registration ──────────────────────────────────────────────

    /// First frame on the agent channel. Carries the agent's hostname, the
    /// shell it will spawn, and the initial PTY dimensions. Missing fields
    /// fall back to defaults rather than rejecting the frame.
    Register {
        #[serde(default = "default_name")]
        name: String,
        #[serde(default = "default_shell")]
        shell: String,
        #[serde(default = "default_rows")]
        rows: u16,
        #[serde(default = "default_cols")]
        cols: u16,
    },

    /// Server's reply to `register`. `url` embeds [`SERVER_URL_TOKEN`];
    /// the agent substitutes it before showing the URL to the user.
    Session { sid: String, url: String },

    // ── Terminal I/O ──────────────────────────────────────────────

    /// PTY output, agent → server → viewers. UTF-8 text, lossy-decoded
    /// from the raw PTY bytes on the agent side.
    Output { data: String },

    /// Keystrokes, viewer → server → agent. Written verbatim to the PTY
    /// master.
    Input { data: String },

    /// Terminal dimensions, viewer → server → agent. The server also
    /// broadcasts refreshed `meta` to the session's viewers.
    Resize { rows: u16, cols: u16 },

    // ── Latency probe ─────────────────────────────────────────────

    /// Sent by a viewer; forwarded to the agent when reachable. Distinct
    /// from transport-level WebSocket keepalive: this measures the full
    /// viewer ↔ agent round trip.
    Ping,

    /// The agent's reply to `ping`, fanned out to viewers. The server
    /// synthesizes one directly when the agent is detached so viewer
    /// latency displays keep updating.
    Pong,

    // ── Session metadata ──────────────────────────────────────────

    /// Server → viewer snapshot of session metadata.
    Meta {
        name: String,
        viewers: usize,
        cols: u16,
        rows: u16,
    },

    /// Server → viewer notice that the agent went away.
    Disconnect { message: String },

    /// Server → viewer error (e.g. unknown session id), sent once before
    /// the server closes the channel.
    Error { message: String },
}

fn default_name() -> String {
    "unknown".to_string()
}

fn default_shell() -> String {
    "/bin/bash".to_string()
}

fn default_rows() -> u16 {
    50
}

fn default_cols() -> u16 {
    220
}
