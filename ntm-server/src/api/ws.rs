//! `/ws`: topic subscriptions with replay over a WebSocket.
//!
//! Client messages are `{"type": "subscribe" | "unsubscribe" | "ping", ...}`.
//! Server frames always carry `type` and the current bus `seq`.

use super::context::RequestContext;
use super::envelope::ApiError;
use crate::app::events::DEFAULT_REPLAY_LIMIT;
use crate::app::hub::{event_frame, frame, origin_allowed, ClientSession, Frame};
use crate::domain::events::{BusEvent, TopicGlob};
use crate::domain::rbac::Identity;
use crate::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::State;
use axum::http::header::ORIGIN;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use std::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe {
        #[serde(default)]
        request_id: Option<String>,
        topics: Vec<String>,
        #[serde(default, alias = "sinceSeq")]
        since_seq: Option<u64>,
    },
    Unsubscribe {
        #[serde(default)]
        request_id: Option<String>,
        topics: Vec<String>,
    },
    Ping {
        #[serde(default)]
        request_id: Option<String>,
    },
}

/// The origin is checked before the upgrade so a refused browser gets a
/// plain 403 instead of a socket.
pub async fn upgrade(
    State(state): State<AppState>,
    ctx: RequestContext,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let origin = headers
        .get(ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    if !origin_allowed(origin.as_deref(), &state.settings.cors_origins, state.auth.mode()) {
        info!(origin = ?origin, user = %ctx.identity.user_id, "websocket origin refused");
        return ApiError::forbidden("origin not allowed").into_response();
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return ApiError::bad_request(rejection.body_text()).into_response(),
    };
    ws.on_upgrade(move |socket| serve(socket, state, ctx.identity, origin))
}

async fn serve(mut socket: WebSocket, state: AppState, identity: Identity, origin: Option<String>) {
    let hub = state.hub.clone();
    let ClientSession { id, tx, mut rx } = hub.register(identity, origin);
    // Eviction closes `rx` only once every sender is gone.
    drop(tx);
    let config = *hub.config();
    let mut ping = tokio::time::interval(config.ping_interval);
    ping.tick().await;
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        last_seen = Instant::now();
                        continue;
                    }
                    Some(Err(err)) => {
                        debug!(client = %id, %err, "websocket read failed");
                        break;
                    }
                };
                last_seen = Instant::now();
                let replies = handle_message(&state, &id, &text);
                if send_all(&mut socket, replies).await.is_err() {
                    break;
                }
            }
            outbound = rx.recv() => {
                let Some(outbound) = outbound else {
                    info!(client = %id, "websocket client evicted");
                    break;
                };
                if socket.send(Message::Text(outbound.to_string())).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if last_seen.elapsed() > config.pong_timeout {
                    info!(client = %id, "websocket client timed out");
                    break;
                }
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
    hub.unregister(&id);
}

async fn send_all(socket: &mut WebSocket, frames: Vec<Frame>) -> Result<(), axum::Error> {
    for frame in frames {
        socket.send(Message::Text(frame.to_string())).await?;
    }
    Ok(())
}

fn handle_message(state: &AppState, client: &str, text: &str) -> Vec<Frame> {
    let seq = state.bus.current_seq();
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(err) => {
            return vec![frame(
                "error",
                seq,
                json!({ "error": format!("invalid message: {err}"), "error_code": "BAD_REQUEST" }),
            )]
        }
    };
    match message {
        ClientMessage::Ping { request_id } => vec![frame("pong", seq, json!({ "request_id": request_id }))],
        ClientMessage::Unsubscribe { request_id, topics } => match state.hub.unsubscribe(client, &topics) {
            Ok(globs) => vec![frame("ack", seq, json!({ "request_id": request_id, "topics": globs }))],
            Err(err) => vec![error_frame(seq, request_id, err, "BAD_REQUEST")],
        },
        ClientMessage::Subscribe {
            request_id,
            topics,
            since_seq,
        } => {
            let globs = match state.hub.subscribe(client, &topics) {
                Ok(globs) => globs,
                Err(err) => return vec![error_frame(seq, request_id, err, "FORBIDDEN")],
            };
            let Some(since) = since_seq else {
                return vec![frame(
                    "ack",
                    seq,
                    json!({ "request_id": request_id, "topics": globs, "reset": false, "replayed": 0 }),
                )];
            };
            let (events, reset) = match replay(state, &globs, since) {
                Ok(replay) => replay,
                Err(err) => return vec![error_frame(seq, request_id, err.message, "INTERNAL")],
            };
            if let Some(last) = events.last() {
                state.hub.mark_delivered(client, last.seq);
            }
            let mut frames = Vec::with_capacity(events.len() + 1);
            frames.push(frame(
                "ack",
                seq,
                json!({
                    "request_id": request_id,
                    "topics": globs,
                    "reset": reset,
                    "replayed": events.len(),
                }),
            ));
            frames.extend(events.iter().map(event_frame));
            frames
        }
    }
}

fn error_frame(seq: u64, request_id: Option<String>, error: String, code: &str) -> Frame {
    frame("error", seq, json!({ "request_id": request_id, "error": error, "error_code": code }))
}

/// Events after `since` across every glob, ordered and without duplicates.
pub(crate) fn replay(
    state: &AppState,
    globs: &[TopicGlob],
    since: u64,
) -> Result<(Vec<BusEvent>, bool), ApiError> {
    let store = state.bus.store();
    let mut reset = false;
    let mut events: Vec<BusEvent> = Vec::new();
    for glob in globs {
        let replay = store.get_since(since, glob, DEFAULT_REPLAY_LIMIT)?;
        reset |= replay.reset;
        events.extend(replay.events);
    }
    events.sort_by_key(|event| event.seq);
    events.dedup_by_key(|event| event.seq);
    events.truncate(DEFAULT_REPLAY_LIMIT);
    Ok((events, reset))
}
