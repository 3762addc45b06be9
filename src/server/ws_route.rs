//! The WebSocket upgrade route.
//!
//! `GET /ws?token=...&project=...`. The token is validated against the
//! store-backed session lookup *before* the upgrade completes; on success
//! the connection is registered with the hub and auto-joined to the named
//! project using the URL parameter.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use uuid::Uuid;

use crate::hub::Connection;
use crate::security::token::validate_token;

use super::AppState;

/// Read deadline: closed if nothing (frame or native pong) arrives within
/// this window. Kept strictly longer than the ping interval below — an
/// internal ticker strictly shorter than the peer's read deadline.
const READ_DEADLINE: Duration = Duration::from_secs(60);
const PING_INTERVAL: Duration = Duration::from_secs(20);
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: String,
    pub project: Uuid,
}

/// `GET /ws?token=...&project=...` — validates the handshake token before
/// upgrading; an invalid token never reaches the WebSocket protocol at all.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    let identity = match validate_token(state.store.as_ref(), &params.token).await {
        Ok(identity) => identity,
        Err(err) => {
            tracing::warn!(error = %err, "websocket handshake rejected");
            return (StatusCode::UNAUTHORIZED, err.to_frame_data().to_string()).into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, identity, params.project))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    identity: crate::security::token::Identity,
    project_id: Uuid,
) {
    let ceiling = state.config.token_usage_default_ceiling;
    let (conn, mut outbound_rx) = Connection::new(
        identity.user_id,
        identity.tenant_id,
        ceiling,
        OUTBOUND_QUEUE_CAPACITY,
    );

    state.hub.register(conn.clone()).await;
    state.hub.join(conn.id, project_id).await;

    let (mut ws_tx, mut ws_rx) = socket.split();

    state
        .hub
        .send_to_connection(
            conn.id,
            &crate::codec::Envelope::new(
                crate::codec::outbound::PROJECT_JOINED,
                serde_json::json!({"project_id": project_id, "success": true}),
                Utc::now().timestamp_millis(),
            ),
        )
        .await;

    let writer = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PING_INTERVAL);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            tokio::select! {
                maybe_bytes = outbound_rx.recv() => {
                    match maybe_bytes {
                        Some(bytes) => {
                            let text = String::from_utf8_lossy(&bytes).into_owned();
                            if ws_tx.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let max_frame_bytes = state.config.ws_max_frame_bytes;
    loop {
        let next = tokio::time::timeout(READ_DEADLINE, ws_rx.next()).await;
        let message = match next {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                tracing::debug!(conn_id = %conn.id, error = %e, "websocket read error, closing");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                tracing::debug!(conn_id = %conn.id, "read deadline elapsed, closing");
                break;
            }
        };

        match message {
            Message::Text(text) => match crate::codec::Envelope::decode(&text, max_frame_bytes) {
                Ok(envelope) => state.orchestrator.handle_frame(&conn, envelope).await,
                Err(err) => {
                    state
                        .hub
                        .send_to_connection(
                            conn.id,
                            &crate::codec::Envelope::error(&err, Utc::now().timestamp_millis()),
                        )
                        .await;
                }
            },
            Message::Binary(_) => {
                tracing::debug!(conn_id = %conn.id, "ignoring unexpected binary frame");
            }
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => break,
        }
    }

    state.orchestrator.handle_disconnect(&conn).await;
    writer.abort();
}
