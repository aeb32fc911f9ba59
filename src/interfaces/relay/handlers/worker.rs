use axum::{
    Json,
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::core::auth::{AuthError, WorkerGrant, WorkerJoinRequest};
use crate::interfaces::relay::AppState;
use crate::interfaces::relay::auth::bearer_token;
use crate::interfaces::relay::error::{ApiError, JsonBody};
use crate::interfaces::relay::hub::{HubError, WorkerSignal};

pub async fn join(
    State(state): State<AppState>,
    JsonBody(payload): JsonBody<WorkerJoinRequest>,
) -> Result<Json<WorkerGrant>, ApiError> {
    if payload.token.trim().is_empty() {
        return Err(ApiError::Validation("token is required".to_string()));
    }
    Ok(Json(state.auth.join_worker(&payload).await?))
}

pub async fn list(State(state): State<AppState>) -> Json<Value> {
    let connected = state.hub.connected_worker().await;
    let workspace = state.hub.workspace().await;
    let mut workers = state
        .auth
        .store()
        .read(|s| s.workers.values().cloned().collect::<Vec<_>>())
        .await;
    workers.sort_by_key(|w| w.created_at);

    let workers: Vec<Value> = workers
        .into_iter()
        .map(|w| {
            let is_connected = connected.as_deref() == Some(w.worker_id.as_str());
            json!({
                "worker_id": w.worker_id,
                "name": w.name,
                "created_at": w.created_at,
                "last_seen": w.last_seen,
                "connected": is_connected,
                "workspace": if is_connected { workspace.clone() } else { None },
            })
        })
        .collect();
    Json(json!({ "workers": workers }))
}

/// `/worker` upgrade: worker credential as bearer, one socket at a time.
pub async fn socket(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(credential) = bearer_token(&headers) else {
        return ApiError::Auth(AuthError::InvalidOrExpiredToken).into_response();
    };
    let worker_id = match state.auth.validate_worker(&credential).await {
        Ok(id) => id,
        Err(e) => return ApiError::Auth(e).into_response(),
    };
    if state.hub.connected_worker().await.is_some() {
        return ApiError::from(HubError::AlreadyConnected).into_response();
    }
    ws.on_upgrade(move |socket| run_worker_socket(socket, state, worker_id))
}

async fn run_worker_socket(socket: WebSocket, state: AppState, worker_id: String) {
    let (mut sink, mut stream) = socket.split();

    // Lost the race against another worker between the check and the upgrade.
    let mut attachment = match state.hub.attach_worker(&worker_id).await {
        Ok(a) => a,
        Err(e) => {
            warn!(worker_id = %worker_id, "Closing worker socket: {}", e);
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: 4409,
                    reason: "worker already connected".into(),
                })))
                .await;
            return;
        }
    };
    let conn_id = attachment.conn_id;

    let writer = tokio::spawn(async move {
        while let Some(text) = attachment.rx.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if state.hub.handle_worker_message(text.as_str()).await == WorkerSignal::Heartbeat {
                    state.auth.touch_worker(&worker_id).await;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(worker_id = %worker_id, "Worker socket error: {}", e);
                break;
            }
        }
    }

    state.hub.detach_worker(conn_id).await;
    writer.abort();
    info!(worker_id = %worker_id, "Worker socket closed");
}
