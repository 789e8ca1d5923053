use axum::{
    extract::{
        Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    response::{IntoResponse, Response},
};
use driftcast_model::ClientMessage;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::errors::AppError;
use crate::events::Subscriber;
use crate::state::AppState;

/// Close code sent when the subscriber cap is reached (RFC 6455 "try again
/// later").
const CLOSE_AT_CAPACITY: u16 = 1013;

/// GET /ws/progress: upgrade to the multiplexed progress channel. Browsers
/// cannot set headers on upgrade requests, so the shared token rides in a
/// query parameter here.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Some(expected) = &state.config.security.api_key
        && params.get("api_key") != Some(expected)
    {
        return AppError::unauthorized("missing or invalid api key").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let subscriber = match state.bus.register() {
        Ok(subscriber) => subscriber,
        Err(_) => {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_AT_CAPACITY,
                    reason: "subscriber limit reached".into(),
                })))
                .await;
            return;
        }
    };
    debug!(subscriber = %subscriber.id, "progress channel opened");

    let (mut sender, mut receiver) = socket.split();

    // Outbound pump: drains the subscriber's bounded queue onto the socket.
    let pump = subscriber.clone();
    let send_task = tokio::spawn(async move {
        while let Some(event) = pump.next_event().await {
            let Ok(json) = serde_json::to_string(&event) else {
                continue;
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                handle_client_message(&subscriber, text.as_str());
            }
            Ok(Message::Binary(bin)) => {
                if let Ok(text) = std::str::from_utf8(bin.as_ref()) {
                    handle_client_message(&subscriber, text);
                }
            }
            // Protocol-level frames count as liveness too.
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => subscriber.mark_pong(),
            Ok(Message::Close(_)) => break,
            Err(err) => {
                debug!(subscriber = %subscriber.id, error = %err, "websocket receive error");
                break;
            }
        }
    }

    state.bus.remove(subscriber.id);
    send_task.abort();
    debug!(subscriber = %subscriber.id, "progress channel closed");
}

fn handle_client_message(subscriber: &Arc<Subscriber>, raw: &str) {
    let message: ClientMessage = match serde_json::from_str(raw) {
        Ok(message) => message,
        Err(err) => {
            warn!(subscriber = %subscriber.id, error = %err, "unparseable client message");
            return;
        }
    };
    match message {
        ClientMessage::Ping | ClientMessage::Pong => subscriber.mark_pong(),
        ClientMessage::Subscribe { job_ids } => subscriber.subscribe(&job_ids),
        ClientMessage::Unsubscribe { job_ids } => subscriber.unsubscribe(&job_ids),
        ClientMessage::SubscribeAll => subscriber.subscribe_all(),
    }
}
