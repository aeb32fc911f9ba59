mod e2e_harness;

use e2e_harness::{Phone, ServerHarness, TestResult};
use futures_util::{SinkExt, StreamExt};
use reqwest::Method;
use serde_json::{Value, json};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;

async fn spawn_or_skip() -> TestResult<Option<ServerHarness>> {
    match ServerHarness::spawn().await {
        Ok(server) => Ok(Some(server)),
        Err(err) if err.to_string().contains("Operation not permitted") => {
            eprintln!("Skipping relay E2E test: socket bind not permitted");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gated_routes_refuse_until_paired() -> TestResult<()> {
    let Some(server) = spawn_or_skip().await? else {
        return Ok(());
    };

    let (status, body) = server
        .request_json(Method::GET, "/pairing/status", None, None)
        .await?;
    assert_eq!(status, 200);
    assert_eq!(body["paired"], false);

    let phone = Phone::new();
    let (status, _) = server
        .request_json(
            Method::POST,
            "/device/session",
            None,
            Some(phone.signed("/device/session")),
        )
        .await?;
    assert_eq!(status, 403);

    let (status, _) = server
        .request_json(
            Method::POST,
            "/pairing/claim",
            None,
            Some(json!({ "code": "not-a-code" })),
        )
        .await?;
    assert_eq!(status, 401);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pair_session_and_worker_join() -> TestResult<()> {
    let Some(server) = spawn_or_skip().await? else {
        return Ok(());
    };

    let mut phone = Phone::new();
    let confirm = phone.pair(&server).await?;
    assert!(confirm["device_id"].as_str().is_some_and(|id| !id.is_empty()));

    let (status, pairing) = server
        .request_json(Method::GET, "/pairing/status", None, None)
        .await?;
    assert_eq!(status, 200);
    assert_eq!(pairing["paired"], true);
    assert_eq!(pairing["device_id"], confirm["device_id"]);

    // A second pairing attempt is refused once a device holds the server.
    let (status, _) = server
        .request_json(Method::GET, "/pairing/qr", None, None)
        .await?;
    assert_eq!(status, 409);

    let signed = phone.signed("/device/session");
    let (status, session) = server
        .request_json(Method::POST, "/device/session", None, Some(signed.clone()))
        .await?;
    assert_eq!(status, 200, "session: {}", session);
    let session_token = session["token"].as_str().unwrap_or_default().to_string();
    assert!(!session_token.is_empty());

    let (status, _) = server
        .request_json(Method::POST, "/device/session", None, Some(signed))
        .await?;
    assert_eq!(status, 401, "replayed signature must be rejected");

    let (status, _) = server
        .request_json(Method::GET, "/workers", Some("bogus"), None)
        .await?;
    assert_eq!(status, 401);

    let (status, join_token) = server
        .request_json(
            Method::POST,
            "/device/worker-join-token",
            None,
            Some(phone.signed("/device/worker-join-token")),
        )
        .await?;
    assert_eq!(status, 200, "join token: {}", join_token);

    let (status, grant) = server
        .request_json(
            Method::POST,
            "/worker/join",
            None,
            Some(json!({ "token": join_token["token"], "name": "e2e-box" })),
        )
        .await?;
    assert_eq!(status, 200, "join: {}", grant);
    let worker_id = grant["worker_id"].as_str().unwrap_or_default().to_string();
    let credential = grant["credential"].as_str().unwrap_or_default().to_string();

    let (status, _) = server
        .request_json(
            Method::POST,
            "/worker/join",
            None,
            Some(json!({ "token": join_token["token"] })),
        )
        .await?;
    assert_eq!(status, 401, "join tokens are single use");

    let mut request = format!("{}/worker", server.ws_base()).into_client_request()?;
    request.headers_mut().insert(
        "authorization",
        HeaderValue::from_str(&format!("Bearer {}", credential))?,
    );
    let (mut ws, _) = tokio_tungstenite::connect_async(request).await?;

    let hello = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await?
        .ok_or("worker socket closed")??;
    let hello: Value = serde_json::from_str(hello.to_text()?)?;
    assert_eq!(hello["type"], "connected");
    assert_eq!(hello["worker_id"], worker_id.as_str());

    ws.send(Message::Text(
        json!({
            "type": "workspace_info",
            "hostname": "e2e-box",
            "workdir": "/srv/app",
            "agent": "claude",
            "max_workers": 2,
        })
        .to_string(),
    ))
    .await?;

    ws.send(Message::Text(json!({ "type": "heartbeat" }).to_string()))
        .await?;
    let ack = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await?
        .ok_or("worker socket closed")??;
    let ack: Value = serde_json::from_str(ack.to_text()?)?;
    assert_eq!(ack["type"], "heartbeat_ack");

    let mut listed = Value::Null;
    for _ in 0..40 {
        let (status, body) = server
            .request_json(Method::GET, "/workers", Some(&session_token), None)
            .await?;
        assert_eq!(status, 200);
        listed = body["workers"][0].clone();
        if listed["connected"] == true && !listed["workspace"].is_null() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(listed["worker_id"], worker_id.as_str());
    assert_eq!(listed["name"], "e2e-box");
    assert_eq!(listed["connected"], true);
    assert_eq!(listed["workspace"]["workdir"], "/srv/app");

    ws.close(None).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pairing_command_reads_server_state() -> TestResult<()> {
    let Some(server) = spawn_or_skip().await? else {
        return Ok(());
    };
    let code = server.pairing_code().await?;

    let output = server.run_cli(&["pairing"])?;
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let spaced = code.chars().map(String::from).collect::<Vec<_>>().join(" ");
    assert!(stdout.contains(&spaced), "stdout: {}", stdout);
    assert!(stdout.contains("voicepilot://pair?"), "stdout: {}", stdout);
    Ok(())
}
