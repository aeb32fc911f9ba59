//! Relay hub: one worker slot, any number of resumable client sessions, and
//! the single active voice call.

use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::config::ServerConfig;
use crate::core::protocol::{
    CLIENT_TO_WORKER, ClientMessage, HubToWorker, WEB_TO_WORKER, WorkerMessage, message_type,
    to_text,
};

#[derive(Debug, Error, PartialEq)]
pub enum HubError {
    #[error("a worker is already connected")]
    AlreadyConnected,
    #[error("no worker is connected")]
    NoWorker,
}

pub type Outbox = mpsc::UnboundedSender<String>;

#[derive(Debug, Clone)]
pub struct HubSettings {
    pub buffer_size: usize,
    pub client_session_ttl: Duration,
    pub call_ttl: Duration,
    pub redispatch_interval: Duration,
}

impl From<&ServerConfig> for HubSettings {
    fn from(c: &ServerConfig) -> Self {
        Self {
            buffer_size: c.event_buffer_size.max(1),
            client_session_ttl: Duration::from_secs(c.client_session_ttl_secs),
            call_ttl: Duration::from_secs(c.call_ttl_secs),
            redispatch_interval: Duration::from_secs(c.call_redispatch_secs),
        }
    }
}

struct WorkerSlot {
    worker_id: String,
    conn_id: u64,
    tx: Outbox,
}

struct ClientSession {
    buffer: VecDeque<(u64, String)>,
    sender: Option<(u64, Outbox)>,
    last_seen: Instant,
    cleanup: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone)]
pub struct ActiveCallRecord {
    pub call_id: String,
    pub ephemeral_key: String,
    pub last_seen: Instant,
    pub last_dispatched_at: Option<Instant>,
}

#[derive(Default)]
struct HubInner {
    worker: Option<WorkerSlot>,
    workspace: Option<Value>,
    sessions: HashMap<String, ClientSession>,
    active_call: Option<ActiveCallRecord>,
    next_event_id: u64,
}

pub struct ClientAttachment {
    pub session_id: String,
    pub conn_id: u64,
    pub resumed: bool,
    pub rx: mpsc::UnboundedReceiver<String>,
}

pub struct WorkerAttachment {
    pub conn_id: u64,
    pub rx: mpsc::UnboundedReceiver<String>,
}

/// What the socket handler should do after the hub processed a worker frame.
#[derive(Debug, PartialEq)]
pub enum WorkerSignal {
    Heartbeat,
    Handled,
    Ignored,
}

pub struct RelayHub {
    settings: HubSettings,
    inner: Mutex<HubInner>,
    next_conn: AtomicU64,
}

impl RelayHub {
    pub fn new(settings: HubSettings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            inner: Mutex::new(HubInner::default()),
            next_conn: AtomicU64::new(1),
        })
    }

    fn conn_id(&self) -> u64 {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    // --- Worker slot ---

    pub async fn connected_worker(&self) -> Option<String> {
        self.inner
            .lock()
            .await
            .worker
            .as_ref()
            .map(|w| w.worker_id.clone())
    }

    pub async fn workspace(&self) -> Option<Value> {
        self.inner.lock().await.workspace.clone()
    }

    /// Occupy the worker slot. Fails if another worker socket holds it.
    pub async fn attach_worker(&self, worker_id: &str) -> Result<WorkerAttachment, HubError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = self.conn_id();
        {
            let mut inner = self.inner.lock().await;
            if inner.worker.is_some() {
                return Err(HubError::AlreadyConnected);
            }
            let _ = tx.send(to_text(&HubToWorker::Connected {
                worker_id: worker_id.to_string(),
            }));
            inner.worker = Some(WorkerSlot {
                worker_id: worker_id.to_string(),
                conn_id,
                tx,
            });
        }
        info!(worker_id = %worker_id, "Worker connected");
        self.broadcast(json!({"type": "worker_status", "connected": true}))
            .await;
        self.dispatch_active_call(false).await;
        Ok(WorkerAttachment { conn_id, rx })
    }

    pub async fn detach_worker(&self, conn_id: u64) {
        let removed = {
            let mut inner = self.inner.lock().await;
            match &inner.worker {
                Some(slot) if slot.conn_id == conn_id => {
                    inner.workspace = None;
                    inner.worker.take().map(|w| w.worker_id)
                }
                _ => None,
            }
        };
        if let Some(worker_id) = removed {
            info!(worker_id = %worker_id, "Worker disconnected");
            self.broadcast(json!({"type": "worker_status", "connected": false}))
                .await;
        }
    }

    /// Deliver a message to the worker if its type is on the allow-list.
    pub async fn send_to_worker(&self, msg: Value) -> Result<(), HubError> {
        let Some(kind) = message_type(&msg) else {
            warn!("Dropping untyped message bound for worker");
            return Ok(());
        };
        if !WEB_TO_WORKER.contains(&kind) {
            warn!(kind = %kind, "Dropping disallowed message bound for worker");
            return Ok(());
        }
        let inner = self.inner.lock().await;
        let slot = inner.worker.as_ref().ok_or(HubError::NoWorker)?;
        slot.tx
            .send(msg.to_string())
            .map_err(|_| HubError::NoWorker)
    }

    pub async fn handle_worker_message(&self, text: &str) -> WorkerSignal {
        let raw: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!("Ignoring malformed worker message: {}", e);
                return WorkerSignal::Ignored;
            }
        };
        let parsed: WorkerMessage = match serde_json::from_value(raw.clone()) {
            Ok(m) => m,
            Err(e) => {
                warn!("Ignoring invalid worker message: {}", e);
                return WorkerSignal::Ignored;
            }
        };
        match parsed {
            WorkerMessage::WorkspaceInfo(_) => {
                self.inner.lock().await.workspace = Some(raw.clone());
                self.broadcast(raw).await;
                WorkerSignal::Handled
            }
            WorkerMessage::TaskResult(_)
            | WorkerMessage::AgentEvent { .. }
            | WorkerMessage::ClientEvent { .. } => {
                self.broadcast(raw).await;
                WorkerSignal::Handled
            }
            WorkerMessage::Heartbeat => {
                let _ = self.send_to_worker(json!({"type": "heartbeat_ack"})).await;
                WorkerSignal::Heartbeat
            }
            WorkerMessage::RequestActiveCall => {
                self.dispatch_active_call(false).await;
                WorkerSignal::Handled
            }
            WorkerMessage::Unknown => {
                warn!(kind = ?message_type(&raw), "Unknown worker message type");
                WorkerSignal::Ignored
            }
        }
    }

    // --- Client sessions ---

    /// Register a client socket. Resumes `session_id` when it is still alive,
    /// replaying buffered events after `last_event_id`; otherwise mints a new
    /// session. The greeting, replay and registration happen under one lock so
    /// no live event can slip in between.
    pub async fn attach_client(
        &self,
        session_id: Option<&str>,
        last_event_id: Option<&str>,
    ) -> ClientAttachment {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = self.conn_id();
        let mut inner = self.inner.lock().await;
        let worker_connected = inner.worker.is_some();

        let existing = session_id.filter(|id| inner.sessions.contains_key(*id));
        let (session_id, resumed) = match existing {
            Some(id) => (id.to_string(), true),
            None => (uuid::Uuid::new_v4().to_string(), false),
        };

        let session = inner
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| ClientSession {
                buffer: VecDeque::new(),
                sender: None,
                last_seen: Instant::now(),
                cleanup: None,
            });
        if let Some(handle) = session.cleanup.take() {
            handle.abort();
        }
        session.last_seen = Instant::now();

        let _ = tx.send(
            json!({"type": "session", "session_id": session_id, "resumed": resumed}).to_string(),
        );
        let _ = tx.send(json!({"type": "worker_status", "connected": worker_connected}).to_string());

        if resumed {
            let after = last_event_id.and_then(|id| id.parse::<u64>().ok());
            let mut replayed = 0;
            for (id, payload) in &session.buffer {
                if after.is_none_or(|a| *id > a) {
                    let _ = tx.send(payload.clone());
                    replayed += 1;
                }
            }
            debug!(session_id = %session_id, replayed, "Client session resumed");
        }

        session.sender = Some((conn_id, tx));
        ClientAttachment {
            session_id,
            conn_id,
            resumed,
            rx,
        }
    }

    /// Mark the client socket gone. The session keeps buffering until the TTL
    /// elapses without a reconnect.
    pub async fn detach_client(self: &Arc<Self>, session_id: &str, conn_id: u64) {
        let mut inner = self.inner.lock().await;
        let Some(session) = inner.sessions.get_mut(session_id) else {
            return;
        };
        // A newer socket owns the session. A sender already cleared by a failed
        // broadcast still needs its cleanup timer.
        if matches!(&session.sender, Some((id, _)) if *id != conn_id) {
            return;
        }
        session.sender = None;
        session.last_seen = Instant::now();
        if let Some(handle) = session.cleanup.take() {
            handle.abort();
        }

        let hub = Arc::clone(self);
        let id = session_id.to_string();
        let ttl = self.settings.client_session_ttl;
        session.cleanup = Some(tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            hub.expire_session(&id).await;
        }));
    }

    async fn expire_session(&self, session_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(session) = inner.sessions.get(session_id)
            && session.sender.is_none()
        {
            inner.sessions.remove(session_id);
            debug!(session_id = %session_id, "Client session expired");
        }
    }

    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }

    /// Stamp an event id, fan it out to live sockets and append it to every
    /// session buffer. Returns the id.
    pub async fn broadcast(&self, mut payload: Value) -> u64 {
        let mut inner = self.inner.lock().await;
        inner.next_event_id += 1;
        let event_id = inner.next_event_id;
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("event_id".to_string(), Value::String(event_id.to_string()));
        }
        let text = payload.to_string();
        let cap = self.settings.buffer_size;

        for session in inner.sessions.values_mut() {
            session.buffer.push_back((event_id, text.clone()));
            while session.buffer.len() > cap {
                session.buffer.pop_front();
            }
            if let Some((_, tx)) = &session.sender
                && tx.send(text.clone()).is_err()
            {
                session.sender = None;
            }
        }
        event_id
    }

    async fn send_to_session(&self, session_id: &str, msg: Value) {
        let inner = self.inner.lock().await;
        if let Some(session) = inner.sessions.get(session_id)
            && let Some((_, tx)) = &session.sender
        {
            let _ = tx.send(msg.to_string());
        }
    }

    pub async fn handle_client_message(&self, session_id: &str, text: &str) {
        let raw: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(session_id = %session_id, "Ignoring malformed client message: {}", e);
                return;
            }
        };
        if let Some(session) = self.inner.lock().await.sessions.get_mut(session_id) {
            session.last_seen = Instant::now();
        }
        let parsed: ClientMessage = match serde_json::from_value(raw.clone()) {
            Ok(m) => m,
            Err(e) => {
                warn!(session_id = %session_id, "Ignoring invalid client message: {}", e);
                return;
            }
        };
        match parsed {
            ClientMessage::InputResponse(_)
            | ClientMessage::FileUploadStart(_)
            | ClientMessage::FileUploadChunk(_) => {
                debug_assert!(message_type(&raw).is_some_and(|t| CLIENT_TO_WORKER.contains(&t)));
                if let Err(e) = self.send_to_worker(raw).await {
                    warn!(session_id = %session_id, "Cannot forward client message: {}", e);
                }
            }
            ClientMessage::Heartbeat => {
                self.send_to_session(session_id, json!({"type": "heartbeat_ack"}))
                    .await;
            }
            ClientMessage::CallHeartbeat {
                call_id,
                ephemeral_key,
                active,
            } => {
                self.call_heartbeat(&call_id, ephemeral_key, active).await;
            }
            ClientMessage::Unknown => {
                warn!(session_id = %session_id, kind = ?message_type(&raw), "Unknown client message type");
            }
        }
    }

    // --- Active call ---

    pub async fn active_call(&self) -> Option<ActiveCallRecord> {
        self.inner.lock().await.active_call.clone()
    }

    pub async fn call_heartbeat(&self, call_id: &str, ephemeral_key: Option<String>, active: bool) {
        let changed = {
            let mut inner = self.inner.lock().await;
            if !active {
                if inner
                    .active_call
                    .as_ref()
                    .is_some_and(|c| c.call_id == call_id)
                {
                    inner.active_call = None;
                    info!(call_id = %call_id, "Active call ended");
                }
                return;
            }
            match inner.active_call.as_mut() {
                Some(call) if call.call_id == call_id => {
                    call.last_seen = Instant::now();
                    match ephemeral_key {
                        Some(key) if key != call.ephemeral_key => {
                            call.ephemeral_key = key;
                            true
                        }
                        _ => false,
                    }
                }
                _ => {
                    let Some(key) = ephemeral_key else {
                        warn!(call_id = %call_id, "Call heartbeat without ephemeral key for unknown call");
                        return;
                    };
                    inner.active_call = Some(ActiveCallRecord {
                        call_id: call_id.to_string(),
                        ephemeral_key: key,
                        last_seen: Instant::now(),
                        last_dispatched_at: None,
                    });
                    info!(call_id = %call_id, "Active call registered");
                    true
                }
            }
        };
        self.dispatch_active_call(changed).await;
    }

    /// Send `connect_call` for the active call when a worker is present and
    /// either `force` is set or the redispatch window has elapsed.
    pub async fn dispatch_active_call(&self, force: bool) -> bool {
        let mut inner = self.inner.lock().await;
        let window = self.settings.redispatch_interval;
        let HubInner {
            worker,
            active_call,
            ..
        } = &mut *inner;
        let (Some(slot), Some(call)) = (worker.as_ref(), active_call.as_mut()) else {
            return false;
        };
        let due = force
            || call
                .last_dispatched_at
                .is_none_or(|at| at.elapsed() >= window);
        if !due {
            return false;
        }
        let msg = HubToWorker::ConnectCall {
            call_id: call.call_id.clone(),
            ephemeral_key: call.ephemeral_key.clone(),
        };
        if slot.tx.send(to_text(&msg)).is_ok() {
            call.last_dispatched_at = Some(Instant::now());
            info!(call_id = %call.call_id, "Dispatched active call to worker");
            true
        } else {
            false
        }
    }

    /// Explicit bridging request from `/connect`: record the call and push it
    /// to the worker immediately.
    pub async fn connect_call(&self, call_id: &str, ephemeral_key: &str) -> Result<(), HubError> {
        if self.connected_worker().await.is_none() {
            return Err(HubError::NoWorker);
        }
        {
            let mut inner = self.inner.lock().await;
            inner.active_call = Some(ActiveCallRecord {
                call_id: call_id.to_string(),
                ephemeral_key: ephemeral_key.to_string(),
                last_seen: Instant::now(),
                last_dispatched_at: None,
            });
        }
        if self.dispatch_active_call(true).await {
            Ok(())
        } else {
            Err(HubError::NoWorker)
        }
    }

    /// Drop the active call when heartbeats stopped arriving.
    pub async fn expire_calls(&self) -> bool {
        let mut inner = self.inner.lock().await;
        let ttl = self.settings.call_ttl;
        if let Some(call) = &inner.active_call
            && call.last_seen.elapsed() > ttl
        {
            info!(call_id = %call.call_id, "Active call expired");
            inner.active_call = None;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(buffer_size: usize) -> HubSettings {
        HubSettings {
            buffer_size,
            client_session_ttl: Duration::from_secs(60),
            call_ttl: Duration::from_millis(30),
            redispatch_interval: Duration::from_secs(10),
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    fn event_ids(msgs: &[Value]) -> Vec<String> {
        msgs.iter()
            .filter_map(|m| m.get("event_id").and_then(Value::as_str).map(String::from))
            .collect()
    }

    #[tokio::test]
    async fn new_client_gets_greeting() {
        let hub = RelayHub::new(settings(10));
        let mut client = hub.attach_client(None, None).await;
        assert!(!client.resumed);
        let msgs = drain(&mut client.rx);
        assert_eq!(msgs[0]["type"], "session");
        assert_eq!(msgs[0]["session_id"], client.session_id.as_str());
        assert_eq!(msgs[1]["type"], "worker_status");
        assert_eq!(msgs[1]["connected"], false);
    }

    #[tokio::test]
    async fn resume_replays_only_events_after_last_id() {
        let hub = RelayHub::new(settings(10));
        let mut client = hub.attach_client(None, None).await;
        drain(&mut client.rx);

        for i in 0..3 {
            hub.broadcast(json!({"type": "agent_event", "event": {"n": i}}))
                .await;
        }
        let seen = event_ids(&drain(&mut client.rx));
        assert_eq!(seen.len(), 3);

        hub.detach_client(&client.session_id, client.conn_id).await;
        for i in 3..6 {
            hub.broadcast(json!({"type": "agent_event", "event": {"n": i}}))
                .await;
        }

        let mut again = hub
            .attach_client(Some(&client.session_id), Some(&seen[2]))
            .await;
        assert!(again.resumed);
        assert_eq!(again.session_id, client.session_id);
        let msgs = drain(&mut again.rx);
        assert_eq!(msgs[0]["resumed"], true);
        let replayed: Vec<i64> = msgs
            .iter()
            .filter(|m| m["type"] == "agent_event")
            .map(|m| m["event"]["n"].as_i64().unwrap())
            .collect();
        assert_eq!(replayed, vec![3, 4, 5]);

        hub.broadcast(json!({"type": "agent_event", "event": {"n": 6}}))
            .await;
        let live = drain(&mut again.rx);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0]["event"]["n"], 6);
    }

    #[tokio::test]
    async fn unknown_last_id_replays_whole_buffer() {
        let hub = RelayHub::new(settings(10));
        let client = hub.attach_client(None, None).await;
        hub.broadcast(json!({"type": "task_result"})).await;
        hub.broadcast(json!({"type": "task_result"})).await;
        hub.detach_client(&client.session_id, client.conn_id).await;

        let mut again = hub
            .attach_client(Some(&client.session_id), Some("not-a-number"))
            .await;
        let replay = event_ids(&drain(&mut again.rx));
        assert_eq!(replay, vec!["1".to_string(), "2".to_string()]);
    }

    #[tokio::test]
    async fn buffer_drops_oldest_first() {
        let hub = RelayHub::new(settings(3));
        let client = hub.attach_client(None, None).await;
        hub.detach_client(&client.session_id, client.conn_id).await;
        for _ in 0..5 {
            hub.broadcast(json!({"type": "agent_event"})).await;
        }
        let mut again = hub.attach_client(Some(&client.session_id), None).await;
        let replay = event_ids(&drain(&mut again.rx));
        assert_eq!(replay, vec!["3", "4", "5"]);
    }

    #[tokio::test]
    async fn expired_session_is_not_resumed() {
        let mut s = settings(10);
        s.client_session_ttl = Duration::from_millis(20);
        let hub = RelayHub::new(s);
        let client = hub.attach_client(None, None).await;
        hub.detach_client(&client.session_id, client.conn_id).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(hub.session_count().await, 0);

        let again = hub.attach_client(Some(&client.session_id), None).await;
        assert!(!again.resumed);
        assert_ne!(again.session_id, client.session_id);
    }

    #[tokio::test]
    async fn reconnect_cancels_cleanup() {
        let mut s = settings(10);
        s.client_session_ttl = Duration::from_millis(30);
        let hub = RelayHub::new(s);
        let client = hub.attach_client(None, None).await;
        hub.detach_client(&client.session_id, client.conn_id).await;
        let _again = hub.attach_client(Some(&client.session_id), None).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(hub.session_count().await, 1);
    }

    #[tokio::test]
    async fn session_with_dead_socket_still_expires() {
        let mut s = settings(10);
        s.client_session_ttl = Duration::from_millis(20);
        let hub = RelayHub::new(s);
        let client = hub.attach_client(None, None).await;
        let (session_id, conn_id) = (client.session_id.clone(), client.conn_id);
        drop(client.rx);

        hub.broadcast(json!({"type": "agent_event"})).await;
        hub.detach_client(&session_id, conn_id).await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(hub.session_count().await, 0);
    }

    #[tokio::test]
    async fn stale_detach_leaves_newer_socket_alone() {
        let mut s = settings(10);
        s.client_session_ttl = Duration::from_millis(20);
        let hub = RelayHub::new(s);
        let first = hub.attach_client(None, None).await;
        let mut second = hub.attach_client(Some(&first.session_id), None).await;
        drain(&mut second.rx);

        hub.detach_client(&first.session_id, first.conn_id).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(hub.session_count().await, 1);
        hub.broadcast(json!({"type": "agent_event"})).await;
        assert_eq!(drain(&mut second.rx).len(), 1);
    }

    #[tokio::test]
    async fn second_worker_is_rejected() {
        let hub = RelayHub::new(settings(10));
        let first = hub.attach_worker("w1").await.unwrap();
        assert!(matches!(
            hub.attach_worker("w2").await,
            Err(HubError::AlreadyConnected)
        ));
        hub.detach_worker(first.conn_id).await;
        assert!(hub.attach_worker("w2").await.is_ok());
    }

    #[tokio::test]
    async fn worker_connect_is_broadcast_and_redispatches_call() {
        let hub = RelayHub::new(settings(10));
        let mut client = hub.attach_client(None, None).await;
        drain(&mut client.rx);
        hub.call_heartbeat("call-1", Some("ek".into()), true).await;

        let mut worker = hub.attach_worker("w1").await.unwrap();
        let to_worker = drain(&mut worker.rx);
        assert_eq!(to_worker[0]["type"], "connected");
        assert_eq!(to_worker[1]["type"], "connect_call");
        assert_eq!(to_worker[1]["call_id"], "call-1");

        let to_client = drain(&mut client.rx);
        assert_eq!(to_client[0]["type"], "worker_status");
        assert_eq!(to_client[0]["connected"], true);

        // Same call, same key, inside the window: no redispatch.
        hub.call_heartbeat("call-1", None, true).await;
        assert!(drain(&mut worker.rx).is_empty());

        // A different call is dispatched right away.
        hub.call_heartbeat("call-2", Some("ek2".into()), true).await;
        let msgs = drain(&mut worker.rx);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["call_id"], "call-2");
    }

    #[tokio::test]
    async fn call_expires_without_heartbeats() {
        let hub = RelayHub::new(settings(10));
        hub.call_heartbeat("c", Some("k".into()), true).await;
        assert!(!hub.expire_calls().await);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(hub.expire_calls().await);
        assert!(hub.active_call().await.is_none());
    }

    #[tokio::test]
    async fn worker_messages_are_routed() {
        let hub = RelayHub::new(settings(10));
        let mut worker = hub.attach_worker("w1").await.unwrap();
        let mut client = hub.attach_client(None, None).await;
        drain(&mut worker.rx);
        drain(&mut client.rx);

        let signal = hub
            .handle_worker_message(r#"{"type":"agent_event","event":{"type":"delta","text":"hi"}}"#)
            .await;
        assert_eq!(signal, WorkerSignal::Handled);
        let msgs = drain(&mut client.rx);
        assert_eq!(msgs[0]["event"]["text"], "hi");
        assert!(msgs[0]["event_id"].is_string());

        assert_eq!(
            hub.handle_worker_message(r#"{"type":"heartbeat"}"#).await,
            WorkerSignal::Heartbeat
        );
        assert_eq!(drain(&mut worker.rx)[0]["type"], "heartbeat_ack");

        assert_eq!(
            hub.handle_worker_message(r#"{"type":"mystery"}"#).await,
            WorkerSignal::Ignored
        );
        assert_eq!(hub.handle_worker_message("not json").await, WorkerSignal::Ignored);
    }

    #[tokio::test]
    async fn client_messages_forward_on_allow_list() {
        let hub = RelayHub::new(settings(10));
        let mut worker = hub.attach_worker("w1").await.unwrap();
        let mut client = hub.attach_client(None, None).await;
        drain(&mut worker.rx);
        drain(&mut client.rx);

        hub.handle_client_message(
            &client.session_id,
            r#"{"type":"input_response","request_id":"r1","response":{"text":"yes"}}"#,
        )
        .await;
        let forwarded = drain(&mut worker.rx);
        assert_eq!(forwarded[0]["type"], "input_response");
        assert_eq!(forwarded[0]["request_id"], "r1");

        hub.handle_client_message(&client.session_id, r#"{"type":"heartbeat"}"#)
            .await;
        assert_eq!(drain(&mut client.rx)[0]["type"], "heartbeat_ack");

        hub.handle_client_message(&client.session_id, r#"{"type":"cancel_everything"}"#)
            .await;
        assert!(drain(&mut worker.rx).is_empty());

        assert!(hub.send_to_worker(json!({"type": "rm_rf"})).await.is_ok());
        assert!(drain(&mut worker.rx).is_empty());
    }
}
