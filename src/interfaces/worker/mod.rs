//! The worker: one outbound socket to the relay, the agent pool, the local
//! bridge for interactive prompts and the sideband for voice calls.

pub mod bridge_server;
pub mod credentials;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::AUTHORIZATION};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::agent::{AgentEvent, AgentPlugin, AgentPool, PoolSettings};
use crate::core::bridge::{LocalBridge, Resolution};
use crate::core::config::VoicepilotConfig;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::protocol::{HubToWorker, TaskResult, WorkerMessage, WorkspaceInfo, to_text};
use crate::core::sideband::SidebandBridge;
use crate::core::uploads::UploadManager;
use credentials::{WorkerCredentials, worker_socket_url};

type Outlet = mpsc::UnboundedSender<WorkerMessage>;

struct ActiveCall {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct WorkerRuntime {
    config: Arc<VoicepilotConfig>,
    data_dir: PathBuf,
    join_token: Option<String>,
    credentials: Option<WorkerCredentials>,
    pool: Arc<AgentPool>,
    bridge: Arc<LocalBridge>,
    uploads: Arc<UploadManager>,
    sideband: Arc<SidebandBridge>,
    outlet: Outlet,
    outbox: Option<mpsc::UnboundedReceiver<WorkerMessage>>,
    calls: Arc<Mutex<HashMap<String, ActiveCall>>>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    http: reqwest::Client,
}

/// The parts of the runtime the hub-message handler and periodic jobs need.
#[derive(Clone)]
pub struct WorkerHandle {
    pool: Arc<AgentPool>,
    bridge: Arc<LocalBridge>,
    uploads: Arc<UploadManager>,
    sideband: Arc<SidebandBridge>,
    outlet: Outlet,
    calls: Arc<Mutex<HashMap<String, ActiveCall>>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl WorkerRuntime {
    pub fn new(
        config: Arc<VoicepilotConfig>,
        data_dir: PathBuf,
        plugin: Arc<dyn AgentPlugin>,
        join_token: Option<String>,
    ) -> Self {
        let settings = PoolSettings::from_config(&config.worker);
        let workdir = settings.workdir.clone();
        let pool = AgentPool::new(plugin, settings);
        let bridge = LocalBridge::new(Duration::from_secs(config.worker.request_timeout_secs));
        let uploads = Arc::new(UploadManager::new(
            &workdir,
            Duration::from_secs(config.worker.upload_timeout_secs),
        ));
        let (outlet, outbox) = mpsc::unbounded_channel();
        let sideband = SidebandBridge::new(
            pool.clone(),
            config.sideband.clone(),
            config.realtime.clone(),
            outlet.clone(),
        );
        Self {
            config,
            data_dir,
            join_token,
            credentials: None,
            pool,
            bridge,
            uploads,
            sideband,
            outlet,
            outbox: Some(outbox),
            calls: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
            http: reqwest::Client::new(),
        }
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            pool: self.pool.clone(),
            bridge: self.bridge.clone(),
            uploads: self.uploads.clone(),
            sideband: self.sideband.clone(),
            outlet: self.outlet.clone(),
            calls: self.calls.clone(),
        }
    }

    fn workspace_info(&self) -> WorkspaceInfo {
        WorkspaceInfo {
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            workdir: self.pool.settings().workdir.display().to_string(),
            agent: self.pool.agent_name().to_string(),
            max_workers: self.pool.settings().max_workers,
        }
    }

    /// Stored credentials win unless a join token was given or the server
    /// changed; then the token is exchanged for fresh ones.
    async fn ensure_credentials(&mut self) -> Result<WorkerCredentials> {
        let server_url = credentials::normalize_server_url(&self.config.worker.server_url);
        let stored = WorkerCredentials::load(&self.data_dir).await?;
        if let Some(token) = &self.join_token {
            let creds = credentials::join(&self.http, &server_url, token).await?;
            creds.save(&self.data_dir).await?;
            return Ok(creds);
        }
        match stored {
            Some(creds) if creds.server_url == server_url => Ok(creds),
            Some(_) => bail!(
                "stored worker credentials belong to another server; pass --join-token to enrol with {}",
                server_url
            ),
            None => bail!("this worker has not joined a server yet; pass --join-token"),
        }
    }
}

#[async_trait]
impl LifecycleComponent for WorkerRuntime {
    async fn on_init(&mut self) -> Result<()> {
        info!("Worker initializing...");
        let creds = self.ensure_credentials().await?;
        info!(worker_id = %creds.worker_id, server = %creds.server_url, "Worker credentials ready");
        self.credentials = Some(creds);
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let listener = bridge_server::bind(self.config.worker.bridge_port)
            .await
            .with_context(|| {
                format!(
                    "local bridge port {} is unavailable",
                    self.config.worker.bridge_port
                )
            })?;
        let bridge = self.bridge.clone();
        let shutdown = self.shutdown.clone();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = bridge_server::serve(bridge, listener, shutdown).await {
                error!("Local bridge crashed: {}", e);
            }
        }));

        self.tasks.push(spawn_event_relay(
            self.handle(),
            self.pool.subscribe(),
            self.shutdown.clone(),
        ));

        let mut bridge_events = self.bridge.attach_consumer();
        let outlet = self.outlet.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(event) = bridge_events.recv().await {
                let _ = outlet.send(WorkerMessage::ClientEvent { event });
            }
        }));

        let Some(creds) = self.credentials.clone() else {
            bail!("worker started without credentials");
        };
        let Some(outbox) = self.outbox.take() else {
            bail!("worker already started");
        };
        let connection = Connection {
            creds,
            workspace: self.workspace_info(),
            heartbeat: Duration::from_secs(self.config.worker.heartbeat_secs.max(1)),
            reconnect_delay: Duration::from_secs(self.config.worker.reconnect_delay_secs.max(1)),
            handle: self.handle(),
            shutdown: self.shutdown.clone(),
        };
        self.tasks.push(tokio::spawn(connection.run(outbox)));
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("Worker shutting down...");
        self.shutdown.cancel();
        let calls: Vec<ActiveCall> = lock(&self.calls).drain().map(|(_, c)| c).collect();
        for call in &calls {
            call.cancel.cancel();
        }
        for call in calls {
            let _ = call.task.await;
        }
        self.pool.shutdown().await;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        Ok(())
    }
}

/// Forward agent events to the relay, report terminal ones as task results
/// and release any prompt a cancelled task was waiting on.
fn spawn_event_relay(
    handle: WorkerHandle,
    mut events: broadcast::Receiver<AgentEvent>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            let event = match event {
                Ok(e) => e,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Agent event relay fell behind");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            handle.relay_agent_event(event);
        }
    })
}

impl WorkerHandle {
    pub fn pool(&self) -> &Arc<AgentPool> {
        &self.pool
    }

    fn client_event(&self, event: Value) {
        let _ = self.outlet.send(WorkerMessage::ClientEvent { event });
    }

    fn relay_agent_event(&self, event: AgentEvent) {
        if event.is_terminal() {
            let (result, duration_ms) = match &event {
                AgentEvent::Done {
                    result,
                    duration_ms,
                    ..
                } => (Some(result.clone()), *duration_ms),
                AgentEvent::Error {
                    message,
                    duration_ms,
                    ..
                } => (Some(message.clone()), *duration_ms),
                AgentEvent::Cancelled { duration_ms, .. } => (None, *duration_ms),
                _ => (None, 0),
            };
            if matches!(event, AgentEvent::Cancelled { .. } | AgentEvent::Error { .. }) {
                self.bridge.cancel_task(event.task_id(), "task_ended");
            }
            let task_result = WorkerMessage::TaskResult(TaskResult {
                task_id: event.task_id().to_string(),
                status: event.status().to_string(),
                result,
                duration_ms: Some(duration_ms),
            });
            let _ = self.send_agent_event(&event);
            let _ = self.outlet.send(task_result);
        } else {
            let _ = self.send_agent_event(&event);
        }
    }

    fn send_agent_event(&self, event: &AgentEvent) -> Result<()> {
        let event = serde_json::to_value(event)?;
        self.outlet
            .send(WorkerMessage::AgentEvent { event })
            .map_err(|_| anyhow::anyhow!("worker outlet closed"))
    }

    /// Handle one message from the hub. Problems are logged, never fatal.
    pub async fn handle_hub_message(&self, text: &str) {
        let msg: HubToWorker = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                warn!("Ignoring invalid hub message: {}", e);
                return;
            }
        };
        match msg {
            HubToWorker::Connected { worker_id } => {
                info!(worker_id = %worker_id, "Relay accepted worker");
            }
            HubToWorker::ConnectCall {
                call_id,
                ephemeral_key,
            } => self.start_call(call_id, ephemeral_key),
            HubToWorker::InputResponse(resp) => {
                let resolution = Resolution {
                    response: resp.response,
                    cancelled: resp.cancelled,
                    reason: resp.cancelled.then(|| "user".to_string()),
                };
                if let Err(e) = self.bridge.resolve(&resp.request_id, resolution) {
                    warn!("Input response dropped: {}", e);
                }
            }
            HubToWorker::CancelTask { task_id } => {
                if self.pool.cancel(task_id.as_deref()).await.is_none() {
                    debug!(task_id = ?task_id, "Nothing to cancel");
                }
            }
            HubToWorker::RetryTask { task_id } => {
                // Waits for a free slot, so it must not hold up the socket loop.
                let handle = self.clone();
                tokio::spawn(async move { handle.retry_task(&task_id).await });
            }
            HubToWorker::FileUploadStart(start) => {
                let file_id = start.file_id.clone();
                if let Err(e) = self.uploads.start(start).await {
                    warn!(file_id = %file_id, "Upload rejected: {}", e);
                    self.client_event(json!({
                        "type": "upload_error",
                        "file_id": file_id,
                        "message": e.to_string(),
                    }));
                }
            }
            HubToWorker::FileUploadChunk(chunk) => {
                let file_id = chunk.file_id.clone();
                match self.uploads.chunk(chunk).await {
                    Ok(Some(done)) => {
                        let path = done.path.display().to_string();
                        self.client_event(json!({
                            "type": "upload_complete",
                            "file_id": done.file_id,
                            "path": path,
                            "size": done.size,
                        }));
                        if let Some(request_id) = done.request_id {
                            let answer = Resolution::answered(json!({ "path": path }));
                            if let Err(e) = self.bridge.resolve(&request_id, answer) {
                                warn!(file_id = %file_id, "Upload finished after its request: {}", e);
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(file_id = %file_id, "Upload chunk rejected: {}", e);
                        self.client_event(json!({
                            "type": "upload_error",
                            "file_id": file_id,
                            "message": e.to_string(),
                        }));
                    }
                }
            }
            HubToWorker::HeartbeatAck => debug!("Heartbeat acknowledged"),
            HubToWorker::Unknown => warn!("Unknown hub message type"),
        }
    }

    async fn retry_task(&self, task_id: &str) {
        let Some(task) = self.pool.get_task(task_id).await else {
            warn!(task_id = %task_id, "Cannot retry unknown task");
            return;
        };
        let thread = self.pool.thread_of(task_id).await;
        match self.pool.execute(&task.description, task.title, thread).await {
            Ok(handle) => info!(from = %task_id, to = %handle.task_id, "Task retried"),
            Err(e) => warn!(task_id = %task_id, "Retry failed: {}", e),
        }
    }

    /// Join a voice call. Repeats for the same call are ignored; a new call
    /// replaces the old one.
    fn start_call(&self, call_id: String, ephemeral_key: String) {
        let mut calls = lock(&self.calls);
        if calls.get(&call_id).is_some_and(|c| !c.task.is_finished()) {
            debug!(call_id = %call_id, "Already bridging call");
            return;
        }
        for (old, call) in calls.drain() {
            info!(call_id = %old, "Leaving previous call");
            call.cancel.cancel();
        }

        let cancel = CancellationToken::new();
        let sideband = self.sideband.clone();
        let outlet = self.outlet.clone();
        let token = cancel.clone();
        let id = call_id.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = sideband.run_call(&id, &ephemeral_key, token).await {
                error!(call_id = %id, "Sideband failed: {:#}", e);
                let _ = outlet.send(WorkerMessage::ClientEvent {
                    event: json!({
                        "type": "system_notice",
                        "call_id": id,
                        "kind": "sideband_failed",
                        "text": format!("Worker could not join the call: {}", e),
                    }),
                });
            }
        });
        calls.insert(call_id, ActiveCall { cancel, task });
    }

    /// Drop stalled uploads and release the prompts waiting on them.
    pub async fn reap_uploads(&self) -> usize {
        let stalled = self.uploads.reap().await;
        for upload in &stalled {
            self.client_event(json!({
                "type": "upload_cancelled",
                "file_id": upload.file_id,
                "reason": "timeout",
            }));
            if let Some(request_id) = &upload.request_id {
                let _ = self.bridge.resolve(request_id, Resolution::cancelled("timeout"));
            }
        }
        stalled.len()
    }
}

/// Reconnecting socket to the relay's `/worker` endpoint.
struct Connection {
    creds: WorkerCredentials,
    workspace: WorkspaceInfo,
    heartbeat: Duration,
    reconnect_delay: Duration,
    handle: WorkerHandle,
    shutdown: CancellationToken,
}

impl Connection {
    async fn run(self, mut outbox: mpsc::UnboundedReceiver<WorkerMessage>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.session(&mut outbox) => match result {
                    Ok(()) => warn!("Relay connection closed, reconnecting..."),
                    Err(e) => warn!("Relay connection failed: {:#}", e),
                },
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
        info!("Relay connection stopped");
    }

    async fn session(&self, outbox: &mut mpsc::UnboundedReceiver<WorkerMessage>) -> Result<()> {
        let url = worker_socket_url(&self.creds.server_url)?;
        let mut request = url.as_str().into_client_request()?;
        request.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.creds.credential))?,
        );
        let (ws, _) = connect_async(request)
            .await
            .with_context(|| format!("connecting to {}", url))?;
        let (mut tx, mut rx) = ws.split();
        info!(url = %url, "Connected to relay");

        tx.send(Message::Text(to_text(&WorkerMessage::WorkspaceInfo(
            self.workspace.clone(),
        ))))
        .await?;
        tx.send(Message::Text(to_text(&WorkerMessage::RequestActiveCall)))
            .await?;

        let mut heartbeat = tokio::time::interval(self.heartbeat);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = tx.close().await;
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    tx.send(Message::Text(to_text(&WorkerMessage::Heartbeat))).await?;
                }
                out = outbox.recv() => {
                    let Some(out) = out else { return Ok(()) };
                    tx.send(Message::Text(to_text(&out))).await?;
                }
                msg = rx.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle.handle_hub_message(&text).await,
                    Some(Ok(Message::Close(frame))) => {
                        if let Some(frame) = frame {
                            warn!(code = u16::from(frame.code), "Relay closed the socket: {}", frame.reason);
                        }
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                },
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::agent::pool::test_support::ScriptPlugin;
    use crate::core::protocol::{FileUploadChunk, FileUploadStart};
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;

    fn runtime(dir: &std::path::Path) -> WorkerRuntime {
        let mut config = VoicepilotConfig::default();
        config.worker.workdir = Some(dir.to_path_buf());
        config.worker.poll_interval_ms = 20;
        WorkerRuntime::new(
            Arc::new(config),
            dir.to_path_buf(),
            Arc::new(ScriptPlugin),
            None,
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<WorkerMessage>) -> Vec<WorkerMessage> {
        let mut out = Vec::new();
        while let Ok(m) = rx.try_recv() {
            out.push(m);
        }
        out
    }

    #[tokio::test]
    async fn terminal_events_become_task_results() {
        let dir = tempfile::tempdir().unwrap();
        let mut rt = runtime(dir.path());
        let mut outbox = rt.outbox.take().unwrap();
        let handle = rt.handle();
        let relay = spawn_event_relay(handle.clone(), rt.pool.subscribe(), rt.shutdown.clone());

        let task = rt.pool.execute("hello", None, None).await.unwrap();
        let mut result = None;
        while let Some(msg) = outbox.recv().await {
            if let WorkerMessage::TaskResult(r) = msg {
                result = Some(r);
                break;
            }
        }
        let result = result.unwrap();
        assert_eq!(result.task_id, task.task_id);
        assert_eq!(result.status, "completed");
        assert_eq!(result.result.as_deref(), Some("hello|"));
        relay.abort();
    }

    #[tokio::test]
    async fn uploaded_file_answers_the_file_request() {
        let dir = tempfile::tempdir().unwrap();
        let mut rt = runtime(dir.path());
        let mut outbox = rt.outbox.take().unwrap();
        let handle = rt.handle();

        let answer = rt
            .bridge
            .register(crate::core::bridge::BridgeRequest::FileRequest {
                id: "req-1".into(),
                task_id: "t-1".into(),
                prompt: None,
                timeout_secs: None,
            })
            .unwrap();

        let start = FileUploadStart {
            file_id: "f1".into(),
            name: "shot.png".into(),
            total_chunks: 1,
            request_id: Some("req-1".into()),
        };
        handle
            .handle_hub_message(&to_text(&HubToWorker::FileUploadStart(start)))
            .await;
        let chunk = FileUploadChunk {
            file_id: "f1".into(),
            index: 0,
            data: STANDARD.encode(b"png"),
        };
        handle
            .handle_hub_message(&to_text(&HubToWorker::FileUploadChunk(chunk)))
            .await;

        let resolution = answer.await.unwrap();
        let path = resolution.response["path"].as_str().unwrap();
        assert!(path.ends_with(".voicepilot/uploads/shot.png"));
        assert!(drain(&mut outbox).iter().any(|m| matches!(
            m,
            WorkerMessage::ClientEvent { event } if event["type"] == "upload_complete"
        )));
    }

    #[tokio::test]
    async fn stalled_upload_is_reported_and_request_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = VoicepilotConfig::default();
        config.worker.workdir = Some(dir.path().to_path_buf());
        config.worker.upload_timeout_secs = 0;
        let mut rt = WorkerRuntime::new(
            Arc::new(config),
            dir.path().to_path_buf(),
            Arc::new(ScriptPlugin),
            None,
        );
        let mut outbox = rt.outbox.take().unwrap();
        let handle = rt.handle();
        let answer = rt
            .bridge
            .register(crate::core::bridge::BridgeRequest::FileRequest {
                id: "req-1".into(),
                task_id: "t-1".into(),
                prompt: None,
                timeout_secs: None,
            })
            .unwrap();
        let start = FileUploadStart {
            file_id: "f1".into(),
            name: "a.txt".into(),
            total_chunks: 2,
            request_id: Some("req-1".into()),
        };
        handle
            .handle_hub_message(&to_text(&HubToWorker::FileUploadStart(start)))
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(handle.reap_uploads().await, 1);
        let resolution = answer.await.unwrap();
        assert_eq!(resolution.reason.as_deref(), Some("timeout"));
        assert!(drain(&mut outbox).iter().any(|m| matches!(
            m,
            WorkerMessage::ClientEvent { event }
                if event["type"] == "upload_cancelled" && event["reason"] == "timeout"
        )));
    }

    #[tokio::test]
    async fn retry_at_capacity_does_not_block_hub_messages() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = VoicepilotConfig::default();
        config.worker.workdir = Some(dir.path().to_path_buf());
        config.worker.poll_interval_ms = 20;
        config.worker.max_workers = 1;
        let rt = WorkerRuntime::new(
            Arc::new(config),
            dir.path().to_path_buf(),
            Arc::new(ScriptPlugin),
            None,
        );
        let handle = rt.handle();
        let running = rt.pool.execute("sleep", None, None).await.unwrap();

        let retry = to_text(&HubToWorker::RetryTask {
            task_id: running.task_id.clone(),
        });
        tokio::time::timeout(Duration::from_millis(500), handle.handle_hub_message(&retry))
            .await
            .expect("retry held up the hub loop");

        let cancel = to_text(&HubToWorker::CancelTask {
            task_id: Some(running.task_id.clone()),
        });
        tokio::time::timeout(Duration::from_millis(500), handle.handle_hub_message(&cancel))
            .await
            .unwrap();

        let mut retried = false;
        for _ in 0..100 {
            if rt.pool.get_tasks().await.len() == 2 {
                retried = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        assert!(retried, "retry never started after the slot was freed");
        rt.pool.cancel(None).await;
    }

    #[tokio::test]
    async fn input_response_resolves_pending_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(dir.path());
        let handle = rt.handle();
        let answer = rt
            .bridge
            .register(crate::core::bridge::BridgeRequest::InputRequest {
                id: "req-9".into(),
                task_id: "t-1".into(),
                question: "Proceed?".into(),
                options: vec![],
                timeout_secs: None,
            })
            .unwrap();
        handle
            .handle_hub_message(
                &json!({"type": "input_response", "request_id": "req-9", "response": "yes"})
                    .to_string(),
            )
            .await;
        assert_eq!(answer.await.unwrap().response, json!("yes"));
    }
}
