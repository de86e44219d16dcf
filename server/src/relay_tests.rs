//! End-to-end relay tests: spin up the real router on an ephemeral port
//! and drive it with tokio-tungstenite clients standing in for the agent
//! and the browser viewers.

use crate::state::AppState;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use hyprshare_protocol::WsMessage;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn spawn_server() -> (SocketAddr, AppState) {
    let state = AppState::new();
    let app = crate::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, state)
}

async fn connect(addr: SocketAddr, path: &str) -> Ws {
    let url = format!("ws://{addr}{path}");
    let (ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .unwrap_or_else(|e| panic!("ws connect to {path} failed: {e}"));
    ws
}

async fn send_msg(ws: &mut Ws, msg: &WsMessage) {
    let text = serde_json::to_string(msg).unwrap();
    ws.send(Message::Text(text.into()))
        .await
        .unwrap_or_else(|e| panic!("ws send failed: {e}"));
}

/// Next protocol frame, skipping transport frames. Panics on timeout.
async fn recv_msg(ws: &mut Ws) -> WsMessage {
    tokio::time::timeout(RECV_TIMEOUT, async {
        while let Some(frame) = ws.next().await {
            if let Ok(Message::Text(text)) = frame {
                if let Ok(msg) = serde_json::from_str::<WsMessage>(text.as_str()) {
                    return msg;
                }
            }
        }
        panic!("connection closed while waiting for a frame");
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for a frame"))
}

/// Register an agent and return its socket plus the assigned sid.
async fn register_agent(addr: SocketAddr, name: &str) -> (Ws, String) {
    let mut agent = connect(addr, "/agent/ws").await;
    send_msg(
        &mut agent,
        &WsMessage::Register {
            name: name.into(),
            shell: "/bin/bash".into(),
            rows: 50,
            cols: 220,
        },
    )
    .await;
    match recv_msg(&mut agent).await {
        WsMessage::Session { sid, url } => {
            assert_eq!(url, format!("__SERVER__/s/{sid}"));
            (agent, sid)
        }
        other => panic!("expected session reply, got {other:?}"),
    }
}

/// Join a viewer and consume its replay + meta preamble.
async fn join_viewer(addr: SocketAddr, sid: &str) -> (Ws, String, WsMessage) {
    let mut viewer = connect(addr, &format!("/viewer/ws/{sid}")).await;
    let replay = match recv_msg(&mut viewer).await {
        WsMessage::Output { data } => data,
        other => panic!("expected replay output first, got {other:?}"),
    };
    let meta = recv_msg(&mut viewer).await;
    assert!(matches!(meta, WsMessage::Meta { .. }), "got {meta:?}");
    (viewer, replay, meta)
}

/// Poll until the session's scrollback satisfies `pred`.
async fn wait_for_scrollback<F>(state: &AppState, sid: &str, pred: F)
where
    F: Fn(&str) -> bool,
{
    for _ in 0..250 {
        if let Some(sess) = state.get_session(sid) {
            if pred(&sess.scrollback_text().await) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("scrollback never reached the expected state");
}

// ─── Scenarios ──────────────────────────────────────────────────

#[tokio::test]
async fn register_handshake_creates_addressable_session() {
    let (addr, state) = spawn_server().await;
    let (_agent, sid) = register_agent(addr, "testhost").await;

    assert_eq!(sid.len(), 10);
    let sess = state.get_session(&sid).unwrap_or_else(|| panic!("session not in registry"));
    assert_eq!(sess.name, "testhost");
    assert!(sess.is_alive().await);

    // The sid from the handshake is the one the REST API lists.
    let listing = crate::api::list_sessions(State(state.clone())).await;
    let summaries = &listing.0.sessions;
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].id, sid);
    assert_eq!(summaries[0].name, "testhost");
    assert!(summaries[0].alive);
    assert_eq!(summaries[0].viewers, 0);

    // And the viewer page resolves for it.
    let page = crate::pages::viewer_page(Path(sid.clone()), State(state.clone()))
        .await
        .into_response();
    assert_eq!(page.status(), axum::http::StatusCode::OK);
    let missing = crate::pages::viewer_page(Path("ffffffffff".into()), State(state))
        .await
        .into_response();
    assert_eq!(missing.status(), axum::http::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn first_viewer_sees_empty_replay_and_counts_itself() {
    let (addr, _state) = spawn_server().await;
    let (_agent, sid) = register_agent(addr, "testhost").await;

    let (_viewer, replay, meta) = join_viewer(addr, &sid).await;
    assert!(replay.is_empty());
    match meta {
        WsMessage::Meta {
            name,
            viewers,
            cols,
            rows,
        } => {
            assert_eq!(name, "testhost");
            assert_eq!(viewers, 1);
            assert_eq!(cols, 220);
            assert_eq!(rows, 50);
        }
        other => panic!("unexpected meta: {other:?}"),
    }
}

#[tokio::test]
async fn output_fans_out_to_every_viewer() {
    let (addr, _state) = spawn_server().await;
    let (mut agent, sid) = register_agent(addr, "testhost").await;

    let (mut viewer_a, _, _) = join_viewer(addr, &sid).await;
    let (mut viewer_b, _, _) = join_viewer(addr, &sid).await;

    send_msg(
        &mut agent,
        &WsMessage::Output {
            data: "hello".into(),
        },
    )
    .await;

    for viewer in [&mut viewer_a, &mut viewer_b] {
        match recv_msg(viewer).await {
            WsMessage::Output { data } => assert_eq!(data, "hello"),
            other => panic!("expected output, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn late_joiner_replay_is_the_concatenated_history() {
    let (addr, state) = spawn_server().await;
    let (mut agent, sid) = register_agent(addr, "testhost").await;

    send_msg(&mut agent, &WsMessage::Output { data: "AAA".into() }).await;
    send_msg(&mut agent, &WsMessage::Output { data: "BBB".into() }).await;
    wait_for_scrollback(&state, &sid, |text| text == "AAABBB").await;

    let (_viewer, replay, _) = join_viewer(addr, &sid).await;
    assert_eq!(replay, "AAABBB");
}

#[tokio::test]
async fn scrollback_replay_is_capped_at_64k() {
    let (addr, state) = spawn_server().await;
    let (mut agent, sid) = register_agent(addr, "testhost").await;

    for _ in 0..7 {
        send_msg(
            &mut agent,
            &WsMessage::Output {
                data: "a".repeat(10_000),
            },
        )
        .await;
    }
    wait_for_scrollback(&state, &sid, |text| text.len() == 64 * 1024).await;

    let (_viewer, replay, _) = join_viewer(addr, &sid).await;
    assert_eq!(replay.len(), 65_536);
    assert!(replay.bytes().all(|b| b == b'a'));
}

#[tokio::test]
async fn viewer_input_reaches_the_agent_in_order() {
    let (addr, _state) = spawn_server().await;
    let (mut agent, sid) = register_agent(addr, "testhost").await;
    let (mut viewer, _, _) = join_viewer(addr, &sid).await;

    send_msg(&mut viewer, &WsMessage::Input { data: "ls".into() }).await;
    send_msg(&mut viewer, &WsMessage::Input { data: "\n".into() }).await;

    match recv_msg(&mut agent).await {
        WsMessage::Input { data } => assert_eq!(data, "ls"),
        other => panic!("expected input, got {other:?}"),
    }
    match recv_msg(&mut agent).await {
        WsMessage::Input { data } => assert_eq!(data, "\n"),
        other => panic!("expected input, got {other:?}"),
    }
}

#[tokio::test]
async fn resize_reaches_agent_and_other_viewers_as_meta() {
    let (addr, _state) = spawn_server().await;
    let (mut agent, sid) = register_agent(addr, "testhost").await;
    let (mut viewer_a, _, _) = join_viewer(addr, &sid).await;
    let (mut viewer_b, _, _) = join_viewer(addr, &sid).await;

    send_msg(
        &mut viewer_a,
        &WsMessage::Resize {
            rows: 40,
            cols: 100,
        },
    )
    .await;

    match recv_msg(&mut agent).await {
        WsMessage::Resize { rows, cols } => {
            assert_eq!((rows, cols), (40, 100));
        }
        other => panic!("expected resize, got {other:?}"),
    }
    match recv_msg(&mut viewer_b).await {
        WsMessage::Meta {
            viewers,
            cols,
            rows,
            ..
        } => {
            assert_eq!(viewers, 2);
            assert_eq!((rows, cols), (40, 100));
        }
        other => panic!("expected meta, got {other:?}"),
    }
}

#[tokio::test]
async fn ping_round_trips_through_the_agent() {
    let (addr, _state) = spawn_server().await;
    let (mut agent, sid) = register_agent(addr, "testhost").await;
    let (mut viewer, _, _) = join_viewer(addr, &sid).await;

    send_msg(&mut viewer, &WsMessage::Ping).await;
    assert!(matches!(recv_msg(&mut agent).await, WsMessage::Ping));

    send_msg(&mut agent, &WsMessage::Pong).await;
    assert!(matches!(recv_msg(&mut viewer).await, WsMessage::Pong));
}

#[tokio::test]
async fn dead_agent_notifies_viewers_and_answers_pings_itself() {
    let (addr, state) = spawn_server().await;
    let (mut agent, sid) = register_agent(addr, "testhost").await;
    let (mut viewer, _, _) = join_viewer(addr, &sid).await;

    agent.close(None).await.unwrap();
    match recv_msg(&mut viewer).await {
        WsMessage::Disconnect { message } => assert!(message.contains("testhost")),
        other => panic!("expected disconnect, got {other:?}"),
    }

    // Detached but inside the grace period: still addressable…
    let sess = state
        .get_session(&sid)
        .unwrap_or_else(|| panic!("session pruned too early"));
    assert!(!sess.is_alive().await);

    // …and the server synthesizes the pong now.
    send_msg(&mut viewer, &WsMessage::Ping).await;
    assert!(matches!(recv_msg(&mut viewer).await, WsMessage::Pong));
}

#[tokio::test]
async fn unknown_session_gets_one_error_then_close() {
    let (addr, _state) = spawn_server().await;
    let mut viewer = connect(addr, "/viewer/ws/doesnotexist").await;

    match recv_msg(&mut viewer).await {
        WsMessage::Error { message } => assert!(message.contains("doesnotexist")),
        other => panic!("expected error, got {other:?}"),
    }

    // Nothing but the close follows.
    let next = tokio::time::timeout(RECV_TIMEOUT, viewer.next()).await;
    match next {
        Ok(None) | Ok(Some(Ok(Message::Close(_)))) => {}
        other => panic!("expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn non_register_first_frame_closes_with_protocol_error() {
    let (addr, _state) = spawn_server().await;
    let mut agent = connect(addr, "/agent/ws").await;

    send_msg(&mut agent, &WsMessage::Ping).await;

    let close = tokio::time::timeout(RECV_TIMEOUT, async {
        while let Some(frame) = agent.next().await {
            if let Ok(Message::Close(frame)) = frame {
                return frame;
            }
        }
        None
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for close"));

    let frame = close.unwrap_or_else(|| panic!("closed without a frame"));
    assert_eq!(u16::from(frame.code), 4000);
}

#[tokio::test]
async fn reconnecting_agent_gets_a_fresh_session() {
    let (addr, state) = spawn_server().await;
    let (mut agent, sid_one) = register_agent(addr, "testhost").await;
    agent.close(None).await.unwrap();

    let (_agent, sid_two) = register_agent(addr, "testhost").await;
    assert_ne!(sid_one, sid_two);

    // The first session is dead, the second alive; both still listed.
    for _ in 0..250 {
        let one = state.get_session(&sid_one);
        if let Some(sess) = one {
            if !sess.is_alive().await {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let old = state.get_session(&sid_one).unwrap_or_else(|| panic!("old session pruned too early"));
    assert!(!old.is_alive().await);
    let new = state.get_session(&sid_two).unwrap_or_else(|| panic!("new session missing"));
    assert!(new.is_alive().await);
}
