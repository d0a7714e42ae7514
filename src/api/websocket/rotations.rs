//! Rotation event stream

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::WS_BUFFER_SIZE;
use crate::api::server::AppState;
use crate::models::RotationEvent;

pub async fn rotations_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_rotations_ws(socket, state))
}

async fn handle_rotations_ws(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<RotationEvent>(WS_BUFFER_SIZE);
    let mut events = state.rotations.subscribe();

    info!("Rotation WebSocket connected");

    let forward_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if tx.try_send(event).is_err() {
                        debug!("Rotation WebSocket buffer full, dropping event");
                    }
                }
                Err(RecvError::Lagged(n)) => warn!(missed = n, "Rotation WebSocket lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!(error = %e, "Failed to serialize rotation event"),
            }
        }
    });

    let receive_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = forward_task => debug!("Rotation forward task ended"),
        _ = send_task => debug!("Rotation send task ended"),
        _ = receive_task => debug!("Rotation receive task ended"),
    }

    info!("Rotation WebSocket disconnected");
}
