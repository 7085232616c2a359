//! WebSocket handler for real-time build events.
//!
//! Anonymous subscribers only see public repositories. A repo token narrows
//! the stream to that repository, private events included; the admin secret
//! sees everything.

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::{
    extract::State,
    http::{HeaderMap, Uri},
    response::Response,
};
use cinder_auth::{TokenKind, peek_subject, verify_token};
use cinder_core::events::{EVENTS_TOPIC, LabelFilter};
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{ApiError, ApiResult};
use crate::middleware::{is_admin, request_token};
use crate::state::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    uri: Uri,
) -> ApiResult<Response> {
    let filter = stream_filter(&state, &headers, &uri).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, filter)))
}

/// Decide what a subscriber may see from the credentials it presented.
pub async fn stream_filter(state: &AppState, headers: &HeaderMap, uri: &Uri) -> ApiResult<LabelFilter> {
    let Some(token) = request_token(headers, uri) else {
        return Ok(LabelFilter::public());
    };
    if is_admin(state, headers, uri) {
        return Ok(LabelFilter::any());
    }

    let denied = || ApiError::Unauthorized("invalid stream token".into());
    let subject = peek_subject(&token).map_err(|_| denied())?;
    let repo = state
        .stores
        .repos
        .find_by_name(&subject)
        .await?
        .ok_or_else(denied)?;
    let valid = verify_token(&token, &repo, TokenKind::Pull).is_ok()
        || verify_token(&token, &repo, TokenKind::Hook).is_ok();
    if !valid {
        return Err(denied());
    }
    Ok(LabelFilter::repo(repo.full_name))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, filter: LabelFilter) {
    let mut subscription = state.bus.subscribe(EVENTS_TOPIC, filter);
    debug!(subscription = %subscription.id, "event stream opened");

    loop {
        tokio::select! {
            message = subscription.stream.next() => {
                let Some(message) = message else { break };
                let text = match serde_json::to_string(&message.payload) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "failed to encode event");
                        continue;
                    }
                };
                if socket.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Ping(data))) => {
                        if socket.send(WsMessage::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.bus.unsubscribe(subscription.id);
    debug!(subscription = %subscription.id, "event stream closed");
}
