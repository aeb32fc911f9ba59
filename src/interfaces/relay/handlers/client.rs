use axum::{
    Json,
    body::Bytes,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::interfaces::relay::AppState;
use crate::interfaces::relay::error::{ApiError, JsonBody};
use crate::interfaces::relay::realtime::{EphemeralSession, mint_ephemeral_key};

#[derive(Debug, Default, Deserialize)]
pub struct SessionRequest {
    #[serde(default)]
    pub voice: Option<String>,
}

/// Mint a realtime ephemeral key for the paired device's voice call.
pub async fn create_realtime_session(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<EphemeralSession>, ApiError> {
    let realtime = &state.config.realtime;
    let request: SessionRequest = if body.iter().all(u8::is_ascii_whitespace) {
        SessionRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::Validation(format!("invalid body: {}", e)))?
    };
    let voice = request.voice.unwrap_or_else(|| realtime.voice.clone());
    if !realtime.is_allowed_voice(&voice) {
        return Err(ApiError::Validation(format!("unknown voice '{}'", voice)));
    }
    let session = mint_ephemeral_key(&state.http, realtime, &voice).await?;
    Ok(Json(session))
}

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub call_id: String,
    pub ephemeral_key: String,
}

/// Ask the worker to bridge an in-progress voice call.
pub async fn connect_call(
    State(state): State<AppState>,
    JsonBody(payload): JsonBody<ConnectRequest>,
) -> Result<Json<Value>, ApiError> {
    if payload.call_id.trim().is_empty() || payload.ephemeral_key.trim().is_empty() {
        return Err(ApiError::Validation(
            "call_id and ephemeral_key are required".to_string(),
        ));
    }
    state
        .hub
        .connect_call(&payload.call_id, &payload.ephemeral_key)
        .await?;
    Ok(Json(json!({ "ok": true, "call_id": payload.call_id })))
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub last_event_id: Option<String>,
}

pub async fn events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| run_client_socket(socket, state, query))
}

async fn run_client_socket(socket: WebSocket, state: AppState, query: EventsQuery) {
    let (mut sink, mut stream) = socket.split();
    let mut attachment = state
        .hub
        .attach_client(query.session_id.as_deref(), query.last_event_id.as_deref())
        .await;
    let session_id = attachment.session_id.clone();
    let conn_id = attachment.conn_id;
    info!(session_id = %session_id, resumed = attachment.resumed, "Client attached");

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
                state
                    .hub
                    .handle_client_message(&session_id, text.as_str())
                    .await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(session_id = %session_id, "Client socket error: {}", e);
                break;
            }
        }
    }

    state.hub.detach_client(&session_id, conn_id).await;
    writer.abort();
    info!(session_id = %session_id, "Client detached");
}
