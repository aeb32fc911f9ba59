//! Loopback socket agent subprocesses use to reach the user.

use anyhow::Result;
use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::bridge::{BridgeReply, BridgeRequest, LocalBridge, Resolution};
use crate::core::protocol::to_text;

pub fn bridge_router(bridge: Arc<LocalBridge>) -> Router {
    Router::new()
        .route("/bridge", get(upgrade))
        .with_state(bridge)
}

/// Bind loopback only; the bridge is never exposed beyond this machine.
pub async fn bind(port: u16) -> Result<TcpListener> {
    Ok(TcpListener::bind(("127.0.0.1", port)).await?)
}

pub async fn serve(
    bridge: Arc<LocalBridge>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("Local bridge listening on ws://{}/bridge", listener.local_addr()?);
    axum::serve(listener, bridge_router(bridge))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn upgrade(State(bridge): State<Arc<LocalBridge>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_bridge_socket(socket, bridge))
}

async fn run_bridge_socket(socket: WebSocket, bridge: Arc<LocalBridge>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut registered = Vec::new();
    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("Bridge socket error: {}", e);
                break;
            }
        };
        let request: BridgeRequest = match serde_json::from_str(text.as_str()) {
            Ok(r) => r,
            Err(e) => {
                warn!("Ignoring malformed bridge request: {}", e);
                continue;
            }
        };
        let Some(id) = request.id().map(str::to_string) else {
            warn!("Ignoring unknown bridge request type");
            continue;
        };

        match bridge.register(request) {
            Ok(answer) => {
                registered.push(id.clone());
                let tx = tx.clone();
                tokio::spawn(async move {
                    let resolution = answer
                        .await
                        .unwrap_or_else(|_| Resolution::cancelled("bridge_closed"));
                    let _ = tx.send(to_text(&BridgeReply::Response { id, resolution }));
                });
            }
            Err(e) => {
                let _ = tx.send(to_text(&BridgeReply::Error {
                    id,
                    error: e.to_string(),
                }));
            }
        }
    }

    // The requester hung up; nothing is left to deliver an answer to.
    for id in registered {
        let _ = bridge.resolve(&id, Resolution::cancelled("requester_disconnected"));
    }
    drop(tx);
    let _ = writer.await;
}
