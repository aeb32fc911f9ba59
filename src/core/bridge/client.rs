//! Client side of the loopback bridge, used by the `ask` and `request-file`
//! commands that agent subprocesses invoke.

use anyhow::{Context, Result, bail};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use super::{BridgeReply, BridgeRequest, Resolution};

pub fn bridge_url(port: u16) -> String {
    format!("ws://127.0.0.1:{}/bridge", port)
}

/// Send one request and wait for its answer.
pub async fn send_request(port: u16, request: BridgeRequest) -> Result<Resolution> {
    let Some(id) = request.id().map(str::to_string) else {
        bail!("request has no id");
    };
    let url = bridge_url(port);
    let (ws, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("worker bridge unreachable at {}", url))?;
    let (mut tx, mut rx) = ws.split();

    tx.send(Message::Text(serde_json::to_string(&request)?))
        .await?;
    debug!(request_id = %id, "Bridge request sent");

    while let Some(msg) = rx.next().await {
        match msg? {
            Message::Text(text) => match serde_json::from_str::<BridgeReply>(&text) {
                Ok(BridgeReply::Response {
                    id: reply_id,
                    resolution,
                }) if reply_id == id => {
                    let _ = tx.close().await;
                    return Ok(resolution);
                }
                Ok(BridgeReply::Error {
                    id: reply_id,
                    error,
                }) if reply_id == id => bail!("{}", error),
                Ok(_) => {}
                Err(e) => debug!("Ignoring bridge frame: {}", e),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
    bail!("bridge closed before answering")
}
