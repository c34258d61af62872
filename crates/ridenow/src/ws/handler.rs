//! Session gateway: WebSocket handshake, receive loop and per-session writer.

use axum::{
    extract::{
        RawQuery, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, Utf8Bytes, WebSocket, close_code},
    },
    http::HeaderMap,
    response::Response,
};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use log::{debug, error, info, warn};
use ridenow_protocol::{ClientAction, ErrorCode, EventKind, ServerEvent};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::AppState;
use crate::auth::request_token;
use crate::rides::{Actor, RideError, RideService};

use super::registry::SessionHandle;

/// Ping interval for keepalive.
const PING_INTERVAL_SECS: u64 = 30;

/// Close code sent when the handshake token is missing, invalid or unknown.
pub const CLOSE_UNAUTHORIZED: u16 = 4001;

/// How long a closing session may take to flush its queued events.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

enum Handshake {
    Accepted(Actor),
    Rejected,
    Failed,
}

/// WebSocket upgrade handler.
///
/// GET /ws?token=...
pub async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    ws: WebSocketUpgrade,
) -> Response {
    let handshake = authenticate(&state, &headers, query.as_deref()).await;

    ws.on_upgrade(move |socket| async move {
        match handshake {
            Handshake::Accepted(actor) => handle_ws_connection(socket, state, actor).await,
            Handshake::Rejected => {
                close_with(socket, CLOSE_UNAUTHORIZED, "Unauthorized").await;
            }
            Handshake::Failed => {
                close_with(socket, close_code::ERROR, "Internal error").await;
            }
        }
    })
}

/// Resolve the connecting user. The caller learns nothing about which check failed.
async fn authenticate(state: &AppState, headers: &HeaderMap, query: Option<&str>) -> Handshake {
    let token = match request_token(headers, query) {
        Ok(Some(token)) => token,
        Ok(None) | Err(_) => {
            debug!("WebSocket handshake without usable token");
            return Handshake::Rejected;
        }
    };

    let user_id = match state.auth.verify_token(&token) {
        Ok(user_id) => user_id,
        Err(e) => {
            debug!("WebSocket token rejected: {}", e);
            return Handshake::Rejected;
        }
    };

    match state.rides.actor(&user_id).await {
        Ok(Some(actor)) => Handshake::Accepted(actor),
        Ok(None) => {
            debug!("WebSocket token for unknown user {}", user_id);
            Handshake::Rejected
        }
        Err(e) => {
            error!("Failed to load user {} during handshake: {}", user_id, e);
            Handshake::Failed
        }
    }
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: Utf8Bytes::from_static(reason),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!("Failed to send close frame: {}", e);
    }
}

/// Handle an authenticated WebSocket connection.
async fn handle_ws_connection(socket: WebSocket, state: AppState, actor: Actor) {
    let (mut sender, mut receiver) = socket.split();

    let (handle, event_rx) = SessionHandle::new(actor.user_id.clone(), actor.is_driver);
    let session_id = handle.session_id();
    state.registry.register(handle.clone());

    let connected = ServerEvent::connected(&actor.user_id, actor.is_driver);
    if let Err(e) = send_event(&mut sender, &connected).await {
        warn!(
            "Failed to send connected message to user {}: {}",
            actor.user_id, e
        );
        state.registry.unregister(&actor.user_id, session_id);
        return;
    }

    let send_task = tokio::spawn(run_writer(sender, event_rx, handle.closed().clone()));

    // Process incoming messages
    loop {
        let msg = tokio::select! {
            _ = handle.closed().cancelled() => {
                debug!("Session {} closed by server", session_id);
                break;
            }
            msg = receiver.next() => msg,
        };

        let reply = match msg {
            Some(Ok(Message::Text(text))) => {
                handle_text(&state.rides, &actor, text.as_str()).await
            }
            Some(Ok(Message::Binary(_))) => Some(ServerEvent::error(
                ErrorCode::InvalidPayload,
                "binary frames are not supported",
            )),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => None,
            Some(Ok(Message::Close(_))) | None => {
                info!("User {} closed WebSocket session {}", actor.user_id, session_id);
                break;
            }
            Some(Err(e)) => {
                warn!("WebSocket error for user {}: {}", actor.user_id, e);
                break;
            }
        };

        if let Some(reply) = reply
            && handle.try_send(reply).is_err()
        {
            warn!(
                "Session {} of user {} cannot take replies, closing",
                session_id, actor.user_id
            );
            break;
        }
    }

    // Clean up
    state.registry.unregister(&actor.user_id, session_id);
    handle.close();
    drop(handle);
    if tokio::time::timeout(DRAIN_TIMEOUT, send_task).await.is_err() {
        warn!("Session {} writer did not finish draining", session_id);
    }
    info!("WebSocket session {} closed for user {}", session_id, actor.user_id);
}

/// The only task that writes to the socket.
///
/// On close it flushes whatever is already queued, then sends a close frame.
async fn run_writer(
    mut sender: SplitSink<WebSocket, Message>,
    mut event_rx: mpsc::Receiver<ServerEvent>,
    closed: CancellationToken,
) {
    let period = Duration::from_secs(PING_INTERVAL_SECS);
    let mut ping_interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            biased;

            event = event_rx.recv() => match event {
                Some(event) => {
                    if send_event(&mut sender, &event).await.is_err() {
                        closed.cancel();
                        return;
                    }
                }
                None => break,
            },

            _ = closed.cancelled() => {
                while let Ok(event) = event_rx.try_recv() {
                    if send_event(&mut sender, &event).await.is_err() {
                        return;
                    }
                }
                break;
            }

            _ = ping_interval.tick() => {
                if send_event(&mut sender, &ServerEvent::ping()).await.is_err() {
                    closed.cancel();
                    return;
                }
            }
        }
    }

    let frame = CloseFrame {
        code: close_code::NORMAL,
        reason: Utf8Bytes::from_static(""),
    };
    let _ = sender.send(Message::Close(Some(frame))).await;
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
) -> Result<(), axum::Error> {
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            warn!("Failed to serialize event {}: {}", event.event, e);
            return Ok(());
        }
    };
    sender.send(Message::Text(json.into())).await
}

/// Interpret one inbound frame. Returns the reply for this session, if any.
async fn handle_text(rides: &RideService, actor: &Actor, text: &str) -> Option<ServerEvent> {
    let action = match text.parse::<ClientAction>() {
        Ok(action) => action,
        Err(e) => {
            debug!("Invalid frame from user {}: {}", actor.user_id, e);
            return Some(ServerEvent::error(ErrorCode::InvalidPayload, e.to_string()));
        }
    };
    debug!("Action {} from user {}", action.name(), actor.user_id);

    let reply = match action {
        ClientAction::Ping => Ok(ServerEvent::pong()),
        ClientAction::RideRequest { pickup, dropoff } => rides
            .request_ride(actor, &pickup, &dropoff)
            .await
            .map(|created| {
                let mut payload = created.ride.event_payload();
                payload["queued"] = json!(created.queued);
                ServerEvent::new(EventKind::RideCreated, payload)
            }),
        ClientAction::RideAccept { ride_id } => rides
            .accept_ride(actor, ride_id)
            .await
            .map(|ride| ServerEvent::new(EventKind::RideAssignedSuccess, ride.event_payload())),
        ClientAction::RideComplete { ride_id } => rides
            .complete_ride(actor, ride_id)
            .await
            .map(|ride| ServerEvent::new(EventKind::RideCompletedSuccess, ride.event_payload())),
        ClientAction::RideCancel { ride_id } => rides
            .cancel_ride(actor, ride_id)
            .await
            .map(|ride| ServerEvent::new(EventKind::RideCancelledSuccess, ride.event_payload())),
        ClientAction::Unknown(name) => {
            return Some(ServerEvent::error(
                ErrorCode::UnknownEvent,
                format!("unknown event: {name}"),
            ));
        }
    };

    Some(reply.unwrap_or_else(|e| ride_error_event(actor, e)))
}

fn ride_error_event(actor: &Actor, err: RideError) -> ServerEvent {
    match &err {
        RideError::Internal(inner) => {
            error!("Action by user {} failed: {:#}", actor.user_id, inner)
        }
        other => debug!("Action by user {} refused: {}", actor.user_id, other),
    }
    ServerEvent::error(err.code(), err.client_message())
}
