//! # REST API Endpoints
//!
//! Provides HTTP API endpoints for querying server state. The dashboard
//! polls `/api/sessions` to render the session list.

use crate::state::{AppState, SessionSummary};
use axum::{extract::State, Json};
use serde::Serialize;

/// Response body of `GET /api/sessions`.
#[derive(Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionSummary>,
}

/// `GET /api/sessions` — Returns a snapshot of every known session,
/// including dead ones still inside their disconnect grace period.
pub async fn list_sessions(State(state): State<AppState>) -> Json<SessionsResponse> {
    let mut sessions = Vec::new();
    for sess in state.all_sessions() {
        sessions.push(sess.summary().await);
    }
    Json(SessionsResponse { sessions })
}
