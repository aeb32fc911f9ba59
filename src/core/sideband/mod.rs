//! Sideband: the worker's own connection to an in-progress realtime voice
//! call. It declares the task tools, runs the calls the model makes against
//! the agent pool and feeds task progress back into the conversation.

pub mod throttle;
pub mod tools;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::AUTHORIZATION};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::agent::{AgentEvent, AgentPool, TaskRecord};
use crate::core::config::{RealtimeConfig, SidebandConfig};
use crate::core::protocol::WorkerMessage;
use crate::core::retry::{Attempt, with_backoff};
use crate::core::ttl::TtlMap;
use throttle::ProgressThrottle;
use tools::{ToolCall, tool_definitions};

const DEFAULT_INSTRUCTIONS: &str = "You are a voice assistant that drives a coding agent on the user's workstation. \
Use run_task for any work on the project, get_tasks to check progress, update_task to change direction and cancel_task to stop. \
Messages starting with [worker] are progress reports from the agent; summarise them briefly when useful. \
Never start the same task twice.";

const RESULT_PREVIEW: usize = 600;
const PROGRESS_PREVIEW: usize = 160;

fn truncate(text: &str, max: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}

/// Whitespace and case do not make two spoken requests different.
fn dedup_key(task: &str) -> String {
    task.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn task_summary(task: &TaskRecord) -> Value {
    json!({
        "task_id": task.id,
        "title": task.title,
        "status": task.status.as_str(),
        "current_tool": task.current_tool,
        "tools_used": task.tool_history.len(),
        "result": task.result.as_deref().map(|r| truncate(r, RESULT_PREVIEW)),
        "error": task.error,
        "duration_ms": task.duration_ms,
    })
}

fn describe_tool(name: &str, input: &Value) -> String {
    let detail = ["command", "file_path", "path", "pattern", "description", "url"]
        .iter()
        .find_map(|k| input.get(*k).and_then(Value::as_str));
    match detail {
        Some(d) => format!("{} {}", name, truncate(d, 80)),
        None => name.to_string(),
    }
}

pub struct SidebandBridge {
    pool: Arc<AgentPool>,
    config: SidebandConfig,
    realtime: RealtimeConfig,
    outlet: mpsc::UnboundedSender<WorkerMessage>,
    recent_runs: Mutex<TtlMap<String, String>>,
    notices: Mutex<TtlMap<String, ()>>,
}

impl SidebandBridge {
    pub fn new(
        pool: Arc<AgentPool>,
        config: SidebandConfig,
        realtime: RealtimeConfig,
        outlet: mpsc::UnboundedSender<WorkerMessage>,
    ) -> Arc<Self> {
        let dedup = Duration::from_millis(config.dedup_window_ms);
        let cooldown = Duration::from_secs(config.notice_cooldown_secs);
        Arc::new(Self {
            pool,
            config,
            realtime,
            outlet,
            recent_runs: Mutex::new(TtlMap::new(dedup)),
            notices: Mutex::new(TtlMap::new(cooldown)),
        })
    }

    fn client_event(&self, event: Value) {
        let _ = self.outlet.send(WorkerMessage::ClientEvent { event });
    }

    /// Announce a connection change at most once per cooldown for a call.
    async fn notice(&self, call_id: &str, kind: &str, text: &str) -> bool {
        let key = format!("{}:{}", call_id, kind);
        if !self.notices.lock().await.insert_if_absent(key, ()) {
            debug!(call_id = %call_id, kind, "Notice suppressed");
            return false;
        }
        self.client_event(json!({
            "type": "system_notice",
            "call_id": call_id,
            "kind": kind,
            "text": text,
        }));
        true
    }

    /// Connect to the call and serve it until the call ends or `cancel` fires.
    pub async fn run_call(
        self: &Arc<Self>,
        call_id: &str,
        ephemeral_key: &str,
        cancel: CancellationToken,
    ) -> Result<()> {
        let (incoming, outgoing, pumps) = self.connect(call_id, ephemeral_key).await?;
        let result = self.serve(call_id, incoming, outgoing, cancel).await;
        for pump in pumps {
            pump.abort();
        }
        result
    }

    async fn connect(
        &self,
        call_id: &str,
        ephemeral_key: &str,
    ) -> Result<(
        mpsc::UnboundedReceiver<Value>,
        mpsc::UnboundedSender<Value>,
        [JoinHandle<()>; 2],
    )> {
        let url = url::Url::parse_with_params(&self.realtime.ws_url, &[("call_id", call_id)])
            .context("invalid realtime ws_url")?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", ephemeral_key))
            .context("invalid ephemeral key")?;
        let delays: Vec<Duration> = self
            .config
            .backoff_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect();

        let ws = with_backoff("sideband connect", self.config.max_attempts, &delays, |_| {
            let url = url.clone();
            let auth = auth.clone();
            async move {
                let mut request = match url.as_str().into_client_request() {
                    Ok(r) => r,
                    Err(e) => return Attempt::Done(Err(anyhow::Error::from(e))),
                };
                request.headers_mut().insert(AUTHORIZATION, auth);
                match connect_async(request).await {
                    Ok((ws, _)) => Attempt::Done(Ok(ws)),
                    Err(e) => Attempt::Retry(anyhow::Error::from(e)),
                }
            }
        })
        .await
        .with_context(|| format!("could not reach realtime call {}", call_id))?;
        info!(call_id = %call_id, "Sideband connected");

        let (mut sink, mut stream) = ws.split();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Value>();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();

        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Value>(&text) {
                        Ok(v) => {
                            if in_tx.send(v).is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!("Ignoring realtime frame: {}", e),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });
        let writer = tokio::spawn(async move {
            while let Some(v) = out_rx.recv().await {
                if sink.send(Message::Text(v.to_string())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });
        Ok((in_rx, out_tx, [reader, writer]))
    }

    /// The per-call event loop over an already open realtime channel.
    pub async fn serve(
        self: &Arc<Self>,
        call_id: &str,
        mut incoming: mpsc::UnboundedReceiver<Value>,
        outgoing: mpsc::UnboundedSender<Value>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let instructions = self
            .realtime
            .instructions
            .clone()
            .unwrap_or_else(|| DEFAULT_INSTRUCTIONS.to_string());
        outgoing
            .send(json!({
                "type": "session.update",
                "session": {
                    "type": "realtime",
                    "instructions": instructions,
                    "tools": tool_definitions(),
                    "tool_choice": "auto",
                }
            }))
            .context("realtime channel closed")?;
        self.notice(call_id, "connected", "Worker joined the call")
            .await;

        let mut progress = self.pool.subscribe();
        let mut throttle = ProgressThrottle::new(
            Duration::from_millis(self.config.progress_min_interval_ms),
            Duration::from_millis(self.config.progress_dup_window_ms),
        );
        let mut flush = tokio::time::interval(
            Duration::from_millis(self.config.progress_min_interval_ms.max(50)),
        );
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(call_id = %call_id, "Sideband cancelled");
                    break;
                }
                msg = incoming.recv() => {
                    let Some(msg) = msg else {
                        info!(call_id = %call_id, "Realtime call ended");
                        break;
                    };
                    self.on_realtime_event(call_id, msg, &outgoing, &mut handlers);
                }
                event = progress.recv() => match event {
                    Ok(event) => self.on_agent_event(call_id, event, &outgoing, &mut throttle).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(call_id = %call_id, skipped = n, "Sideband fell behind on progress");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = flush.tick() => {
                    if let Some(text) = throttle.flush(Instant::now()) {
                        self.inject(call_id, &text, &outgoing, false);
                    }
                }
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = joined {
                        warn!(call_id = %call_id, "Tool handler panicked: {}", e);
                    }
                }
            }
        }

        while let Some(joined) = handlers.join_next().await {
            if let Err(e) = joined {
                warn!(call_id = %call_id, "Tool handler panicked: {}", e);
            }
        }
        self.notice(call_id, "disconnected", "Worker left the call")
            .await;
        Ok(())
    }

    fn on_realtime_event(
        self: &Arc<Self>,
        call_id: &str,
        msg: Value,
        outgoing: &mpsc::UnboundedSender<Value>,
        handlers: &mut JoinSet<()>,
    ) {
        match msg.get("type").and_then(Value::as_str).unwrap_or_default() {
            "response.function_call_arguments.done" => {
                let fn_call_id = msg
                    .get("call_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let name = msg
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let arguments = msg
                    .get("arguments")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                info!(call_id = %call_id, tool = %name, "Tool call");

                let this = Arc::clone(self);
                let outgoing = outgoing.clone();
                handlers.spawn(async move {
                    let output = match ToolCall::parse(&name, &arguments) {
                        Ok(call) => this.handle_tool(call).await,
                        Err(e) => json!({ "status": "error", "message": e }),
                    };
                    let _ = outgoing.send(json!({
                        "type": "conversation.item.create",
                        "item": {
                            "type": "function_call_output",
                            "call_id": fn_call_id,
                            "output": output.to_string(),
                        }
                    }));
                    let _ = outgoing.send(json!({ "type": "response.create" }));
                });
            }
            "error" => warn!(call_id = %call_id, "Realtime error: {}", msg["error"]),
            other => debug!(call_id = %call_id, event = other, "Realtime event"),
        }
    }

    pub async fn handle_tool(&self, call: ToolCall) -> Value {
        match call {
            ToolCall::RunTask { task, title } => {
                let key = dedup_key(&task);
                {
                    let mut recent = self.recent_runs.lock().await;
                    if let Some(existing) = recent.get(&key) {
                        info!(task_id = %existing, "Duplicate run_task suppressed");
                        return json!({
                            "status": "already_running",
                            "task_id": existing,
                            "message": "This task was just started; not starting it again.",
                        });
                    }
                    recent.insert(key.clone(), String::new());
                }
                match self.pool.execute(&task, title, None).await {
                    Ok(handle) => {
                        self.recent_runs
                            .lock()
                            .await
                            .insert(key, handle.task_id.clone());
                        json!({ "status": "started", "task_id": handle.task_id })
                    }
                    Err(e) => {
                        self.recent_runs.lock().await.remove(&key);
                        json!({ "status": "error", "message": e.to_string() })
                    }
                }
            }
            ToolCall::GetTasks { task_id: Some(id) } => match self.pool.get_task(&id).await {
                Some(task) => task_summary(&task),
                None => json!({ "status": "not_found", "task_id": id }),
            },
            ToolCall::GetTasks { task_id: None } => {
                let tasks = self.pool.get_tasks().await;
                let recent: Vec<Value> = tasks.iter().rev().take(10).map(task_summary).collect();
                json!({ "tasks": recent, "active": self.pool.active_count().await })
            }
            ToolCall::CancelTask { task_id } => match self.pool.cancel(task_id.as_deref()).await {
                Some(id) => json!({ "status": "cancelled", "task_id": id }),
                None => json!({ "status": "not_found", "message": "No running task to cancel." }),
            },
            ToolCall::UpdateTask {
                task_id,
                message,
                title,
            } => match self.pool.update(task_id.as_deref(), &message, title).await {
                Ok((previous, handle)) => json!({
                    "status": "updated",
                    "previous_task_id": previous,
                    "task_id": handle.task_id,
                }),
                Err(e) => json!({ "status": "error", "message": e.to_string() }),
            },
            ToolCall::Unknown(name) => {
                json!({ "status": "error", "message": format!("unknown tool '{}'", name) })
            }
        }
    }

    async fn on_agent_event(
        &self,
        call_id: &str,
        event: AgentEvent,
        outgoing: &mpsc::UnboundedSender<Value>,
        throttle: &mut ProgressThrottle,
    ) {
        let label = match self.pool.get_task(event.task_id()).await {
            Some(task) => task.label().to_string(),
            None => event.task_id().to_string(),
        };
        match &event {
            AgentEvent::ToolUse { name, input, .. } => {
                let line = format!("[worker] {}: {}", label, describe_tool(name, input));
                if let Some(text) = throttle.offer(line, Instant::now()) {
                    self.inject(call_id, &text, outgoing, false);
                }
            }
            AgentEvent::Delta { text, .. } => {
                let first = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
                if first.is_empty() {
                    return;
                }
                let line = format!("[worker] {}: {}", label, truncate(first, PROGRESS_PREVIEW));
                if let Some(text) = throttle.offer(line, Instant::now()) {
                    self.inject(call_id, &text, outgoing, false);
                }
            }
            AgentEvent::Done { result, .. } => {
                let line = format!(
                    "[worker] Task \"{}\" finished: {}",
                    label,
                    truncate(result, RESULT_PREVIEW)
                );
                throttle.force(&line, Instant::now());
                self.inject(call_id, &line, outgoing, true);
            }
            AgentEvent::Error { message, .. } => {
                let line = format!(
                    "[worker] Task \"{}\" failed: {}",
                    label,
                    truncate(message, RESULT_PREVIEW)
                );
                throttle.force(&line, Instant::now());
                self.inject(call_id, &line, outgoing, true);
            }
            AgentEvent::Cancelled { .. } => {
                let line = format!("[worker] Task \"{}\" was cancelled.", label);
                throttle.force(&line, Instant::now());
                self.inject(call_id, &line, outgoing, false);
            }
        }
    }

    /// Add a progress line to the conversation and mirror it to the client
    /// transcript. `respond` asks the model to speak about it.
    fn inject(&self, call_id: &str, text: &str, outgoing: &mpsc::UnboundedSender<Value>, respond: bool) {
        let _ = outgoing.send(json!({
            "type": "conversation.item.create",
            "item": {
                "type": "message",
                "role": "user",
                "content": [{ "type": "input_text", "text": text }],
            }
        }));
        if respond {
            let _ = outgoing.send(json!({ "type": "response.create" }));
        }
        self.client_event(json!({
            "type": "transcript",
            "role": "system",
            "source": "worker",
            "call_id": call_id,
            "text": text,
        }));
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::agent::pool::test_support::pool;

    fn bridge(
        dir: &std::path::Path,
    ) -> (
        Arc<SidebandBridge>,
        mpsc::UnboundedReceiver<WorkerMessage>,
        Arc<AgentPool>,
    ) {
        let pool = pool(dir, 2, Duration::from_secs(60));
        let (tx, rx) = mpsc::unbounded_channel();
        let bridge = SidebandBridge::new(
            pool.clone(),
            SidebandConfig::default(),
            RealtimeConfig::default(),
            tx,
        );
        (bridge, rx, pool)
    }

    fn function_call(id: &str, name: &str, args: Value) -> Value {
        json!({
            "type": "response.function_call_arguments.done",
            "call_id": id,
            "name": name,
            "arguments": args.to_string(),
        })
    }

    fn outputs(out: &mut mpsc::UnboundedReceiver<Value>) -> Vec<Value> {
        let mut found = Vec::new();
        while let Ok(v) = out.try_recv() {
            if v["item"]["type"] == "function_call_output" {
                let output: Value =
                    serde_json::from_str(v["item"]["output"].as_str().unwrap()).unwrap();
                found.push(json!({ "call_id": v["item"]["call_id"], "output": output }));
            }
        }
        found
    }

    #[tokio::test]
    async fn unreachable_call_fails_after_every_attempt() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        // Accepts and hangs up, so every handshake fails.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        let server = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(socket);
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = SidebandConfig {
            max_attempts: 3,
            backoff_ms: vec![10, 20],
            ..SidebandConfig::default()
        };
        let realtime = RealtimeConfig {
            ws_url: format!("ws://127.0.0.1:{}/realtime", port),
            ..RealtimeConfig::default()
        };
        let bridge = SidebandBridge::new(
            pool(dir.path(), 1, Duration::from_secs(60)),
            config,
            realtime,
            tx,
        );

        let err = bridge
            .run_call("call-x", "ek", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("could not reach realtime call call-x"));
        assert_eq!(accepted.load(Ordering::SeqCst), 3);
        server.abort();
    }

    #[tokio::test]
    async fn duplicate_run_task_starts_one_task() {
        let dir = tempfile::tempdir().unwrap();
        let (bridge, _events, pool) = bridge(dir.path());
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();

        in_tx
            .send(function_call("c1", "run_task", json!({"task": "sleep and fix tests"})))
            .unwrap();
        in_tx
            .send(function_call("c2", "run_task", json!({"task": "Sleep  and fix TESTS"})))
            .unwrap();
        drop(in_tx);

        bridge
            .serve("call-1", in_rx, out_tx, CancellationToken::new())
            .await
            .unwrap();

        let first = out_rx.recv().await.unwrap();
        assert_eq!(first["type"], "session.update");
        assert_eq!(first["session"]["tools"].as_array().unwrap().len(), 4);

        let results = outputs(&mut out_rx);
        assert_eq!(results.len(), 2);
        let statuses: Vec<&str> = results
            .iter()
            .map(|r| r["output"]["status"].as_str().unwrap())
            .collect();
        assert!(statuses.contains(&"started"));
        assert!(statuses.contains(&"already_running"));
        assert_eq!(pool.get_tasks().await.len(), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_and_status_tools_drive_the_pool() {
        let dir = tempfile::tempdir().unwrap();
        let (bridge, _events, pool) = bridge(dir.path());

        let started = bridge
            .handle_tool(ToolCall::RunTask {
                task: "sleep on it".into(),
                title: Some("Nap".into()),
            })
            .await;
        let task_id = started["task_id"].as_str().unwrap().to_string();

        let status = bridge
            .handle_tool(ToolCall::GetTasks {
                task_id: Some(task_id.clone()),
            })
            .await;
        assert_eq!(status["title"], "Nap");

        let cancelled = bridge
            .handle_tool(ToolCall::CancelTask { task_id: None })
            .await;
        assert_eq!(cancelled["status"], "cancelled");
        assert_eq!(cancelled["task_id"], task_id.as_str());

        let missing = bridge
            .handle_tool(ToolCall::GetTasks {
                task_id: Some("t-nope".into()),
            })
            .await;
        assert_eq!(missing["status"], "not_found");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn task_completion_is_injected_and_mirrored() {
        let dir = tempfile::tempdir().unwrap();
        let (bridge, mut events, pool) = bridge(dir.path());
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let serving = {
            let bridge = bridge.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { bridge.serve("call-1", in_rx, out_tx, cancel).await })
        };
        in_tx
            .send(function_call("c1", "run_task", json!({"task": "say hi", "title": "Greeting"})))
            .unwrap();

        let mut injected = None;
        while let Some(v) = out_rx.recv().await {
            let text = v["item"]["content"][0]["text"].as_str().unwrap_or_default();
            if text.contains("finished") {
                injected = Some(text.to_string());
                break;
            }
        }
        assert_eq!(
            injected.unwrap(),
            "[worker] Task \"Greeting\" finished: say hi|"
        );
        cancel.cancel();
        serving.await.unwrap().unwrap();

        let mut kinds = Vec::new();
        while let Ok(WorkerMessage::ClientEvent { event }) = events.try_recv() {
            kinds.push(event["type"].as_str().unwrap().to_string());
        }
        assert_eq!(kinds.first().map(String::as_str), Some("system_notice"));
        assert!(kinds.iter().any(|k| k == "transcript"));
        assert_eq!(kinds.last().map(String::as_str), Some("system_notice"));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn notices_respect_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let (bridge, mut events, _pool) = bridge(dir.path());
        assert!(bridge.notice("call-1", "connected", "hi").await);
        assert!(!bridge.notice("call-1", "connected", "hi").await);
        assert!(bridge.notice("call-2", "connected", "hi").await);
        let mut count = 0;
        while events.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[test]
    fn dedup_key_ignores_case_and_spacing() {
        assert_eq!(dedup_key("  Fix   the Build "), "fix the build");
    }
}
