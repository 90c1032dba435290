//! Live duplex connection for drivers and passengers.
//!
//! The first frame must be `{"token": ...}` and arrive within the auth window;
//! anything else closes the socket with a protocol error before the hub ever
//! sees it. Once registered, a read task and a write task run side by side and
//! whichever ends first takes the other down with it.

use std::borrow::Cow;
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::auth::{Identity, Role};
use crate::config::HubConfig;
use crate::error::AppError;
use crate::hub::{ConnectionId, Outbound, Target};
use crate::models::frames::{AuthAck, AuthFrame, ClientFrame, ServerFrame};
use crate::state::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let max_frame_bytes = state.hub_config.max_frame_bytes;
    ws.max_message_size(max_frame_bytes)
        .max_frame_size(max_frame_bytes)
        .on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let identity = match authenticate(&mut socket, &state).await {
        Ok(identity) => identity,
        Err(err) => {
            warn!(error = %err, "websocket authentication failed");
            close(socket, close_code::PROTOCOL, "authentication failed").await;
            return;
        }
    };

    let (info, outbound) = match state.hub.register(identity.user_id, identity.role).await {
        Ok(registered) => registered,
        Err(err) => {
            warn!(user_id = %identity.user_id, error = %err, "hub refused connection");
            close(socket, close_code::AWAY, "shutting down").await;
            return;
        }
    };

    let ack = match serde_json::to_string(&AuthAck::authenticated(identity.user_id)) {
        Ok(ack) => ack,
        Err(err) => {
            warn!(error = %err, "failed to encode auth ack");
            release(&state, info.id).await;
            return;
        }
    };
    if socket.send(Message::Text(ack)).await.is_err() {
        release(&state, info.id).await;
        return;
    }

    info!(
        connection_id = %info.id,
        user_id = %identity.user_id,
        role = %identity.role,
        "websocket client connected"
    );

    let (sender, receiver) = socket.split();
    let mut write_task = tokio::spawn(write_loop(sender, outbound, state.hub_config.clone()));
    let mut read_task = tokio::spawn(read_loop(receiver, state.clone(), identity, info.id));

    tokio::select! {
        _ = &mut write_task => read_task.abort(),
        _ = &mut read_task => write_task.abort(),
    }

    release(&state, info.id).await;
    info!(connection_id = %info.id, user_id = %identity.user_id, "websocket client disconnected");
}

async fn release(state: &AppState, id: ConnectionId) {
    if let Err(err) = state.hub.unregister(id).await {
        debug!(connection_id = %id, error = %err, "unregister after hub shutdown");
    }
}

async fn authenticate(socket: &mut WebSocket, state: &AppState) -> Result<Identity, AppError> {
    let first = time::timeout(state.hub_config.auth_timeout, socket.recv())
        .await
        .map_err(|_| AppError::Unauthorized("no credentials before auth timeout".to_string()))?;

    let text = match first {
        Some(Ok(Message::Text(text))) => text,
        Some(Ok(_)) => {
            return Err(AppError::Unauthorized(
                "first frame must be a text auth frame".to_string(),
            ))
        }
        Some(Err(err)) => return Err(AppError::Unauthorized(format!("transport error: {err}"))),
        None => return Err(AppError::Unauthorized("closed before auth".to_string())),
    };

    let frame: AuthFrame = serde_json::from_str(&text)
        .map_err(|err| AppError::Unauthorized(format!("malformed auth frame: {err}")))?;
    state.verifier.verify(&frame.token)
}

async fn close(mut socket: WebSocket, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

async fn write_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    config: HubConfig,
) {
    let period = config.ping_period();
    let mut ping = time::interval_at(Instant::now() + period, period);

    loop {
        let message = tokio::select! {
            payload = outbound.recv() => match payload {
                Some(payload) => Message::Text(payload.to_string()),
                None => {
                    // Queue closed by the hub: unregistered or dropped as too slow.
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: Cow::Borrowed("closing"),
                        })))
                        .await;
                    return;
                }
            },
            _ = ping.tick() => Message::Ping(Vec::new()),
        };

        match time::timeout(config.write_wait, sender.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(error = %err, "websocket write failed");
                return;
            }
            Err(_) => {
                debug!("websocket write timed out");
                return;
            }
        }
    }
}

async fn read_loop(
    mut receiver: SplitStream<WebSocket>,
    state: Arc<AppState>,
    identity: Identity,
    connection_id: ConnectionId,
) {
    let pong_wait = state.hub_config.pong_wait;
    let mut deadline = Instant::now() + pong_wait;

    loop {
        let message = match time::timeout_at(deadline, receiver.next()).await {
            Err(_) => {
                warn!(connection_id = %connection_id, "no pong before deadline");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(err))) => {
                debug!(connection_id = %connection_id, error = %err, "websocket read failed");
                return;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => match handle_frame(&state, identity, &text).await {
                Ok(Some(response)) => reply(&state, connection_id, &response).await,
                Ok(None) => {}
                Err(err) => {
                    debug!(connection_id = %connection_id, error = %err, "frame rejected");
                    let frame = ServerFrame::Error {
                        message: err.to_string(),
                    };
                    reply(&state, connection_id, &frame).await;
                }
            },
            Message::Pong(_) => deadline = Instant::now() + pong_wait,
            Message::Close(_) => return,
            Message::Ping(_) => {}
            Message::Binary(_) => {
                let frame = ServerFrame::Error {
                    message: "binary frames are not supported".to_string(),
                };
                reply(&state, connection_id, &frame).await;
            }
        }
    }
}

/// Returns the frame to send back to this connection, if any.
async fn handle_frame(
    state: &AppState,
    identity: Identity,
    text: &str,
) -> Result<Option<ServerFrame>, AppError> {
    match ClientFrame::parse(text)? {
        ClientFrame::Ping => Ok(Some(ServerFrame::Pong {
            status: "ok".to_string(),
        })),
        ClientFrame::RideResponse(frame) => {
            identity.require_role(Role::Driver)?;
            state.responder.respond(identity.user_id, frame).await?;
            Ok(None)
        }
        ClientFrame::LocationUpdate(frame) => {
            identity.require_role(Role::Driver)?;
            state.locations.update(identity.user_id, frame.into()).await?;
            Ok(None)
        }
    }
}

async fn reply(state: &AppState, connection_id: ConnectionId, frame: &ServerFrame) {
    if let Err(err) = state.hub.send(Target::Connection(connection_id), frame).await {
        debug!(connection_id = %connection_id, error = %err, "failed to queue reply");
    }
}
