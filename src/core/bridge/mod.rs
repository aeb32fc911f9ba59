//! Pending interactive requests raised by agent subprocesses (ask the user,
//! show a form, request a file) and the answers that come back from the
//! client. One pending request per task at a time.

pub mod client;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error, PartialEq)]
pub enum BridgeError {
    #[error("task '{0}' already has a pending request")]
    TaskBusy(String),
    #[error("unknown request '{0}'")]
    UnknownRequest(String),
    #[error("request '{0}' is already pending")]
    DuplicateRequest(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Input,
    Form,
    File,
}

impl RequestKind {
    fn event_type(self) -> &'static str {
        match self {
            RequestKind::Input => "input_request",
            RequestKind::Form => "form_request",
            RequestKind::File => "file_request",
        }
    }
}

/// Loopback socket, CLI → worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeRequest {
    InputRequest {
        id: String,
        task_id: String,
        question: String,
        #[serde(default)]
        options: Vec<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    FormRequest {
        id: String,
        task_id: String,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        fields: Value,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    FileRequest {
        id: String,
        task_id: String,
        #[serde(default)]
        prompt: Option<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    #[serde(other)]
    Unknown,
}

impl BridgeRequest {
    pub fn id(&self) -> Option<&str> {
        match self {
            BridgeRequest::InputRequest { id, .. }
            | BridgeRequest::FormRequest { id, .. }
            | BridgeRequest::FileRequest { id, .. } => Some(id),
            BridgeRequest::Unknown => None,
        }
    }
}

/// Loopback socket, worker → CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeReply {
    Response {
        id: String,
        #[serde(flatten)]
        resolution: Resolution,
    },
    Error {
        id: String,
        error: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resolution {
    #[serde(default)]
    pub response: Value,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Resolution {
    pub fn answered(response: Value) -> Self {
        Self {
            response,
            cancelled: false,
            reason: None,
        }
    }

    pub fn cancelled(reason: &str) -> Self {
        Self {
            response: Value::Null,
            cancelled: true,
            reason: Some(reason.to_string()),
        }
    }
}

struct Pending {
    task_id: String,
    kind: RequestKind,
    reply: oneshot::Sender<Resolution>,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct BridgeInner {
    pending: HashMap<String, Pending>,
    by_task: HashMap<String, String>,
    consumer: Option<mpsc::UnboundedSender<Value>>,
    queued: Vec<Value>,
}

pub struct LocalBridge {
    default_timeout: Duration,
    inner: Mutex<BridgeInner>,
}

impl LocalBridge {
    pub fn new(default_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            default_timeout,
            inner: Mutex::new(BridgeInner::default()),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BridgeInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take over the event stream. Anything emitted while nobody listened is
    /// delivered first.
    pub fn attach_consumer(&self) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let queued = std::mem::take(&mut inner.queued);
        if !queued.is_empty() {
            debug!(count = queued.len(), "Flushing queued bridge events");
        }
        for event in queued {
            let _ = tx.send(event);
        }
        inner.consumer = Some(tx);
        rx
    }

    fn emit(inner: &mut BridgeInner, event: Value) {
        let event = match inner.consumer.as_ref() {
            Some(tx) => match tx.send(event) {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };
        inner.consumer = None;
        inner.queued.push(event);
    }

    /// Register a request and return the receiver its answer arrives on.
    pub fn register(
        self: &Arc<Self>,
        request: BridgeRequest,
    ) -> Result<oneshot::Receiver<Resolution>, BridgeError> {
        let (kind, id, task_id, timeout_secs, mut event) = match request {
            BridgeRequest::InputRequest {
                id,
                task_id,
                question,
                options,
                timeout_secs,
            } => (
                RequestKind::Input,
                id,
                task_id,
                timeout_secs,
                json!({ "question": question, "options": options }),
            ),
            BridgeRequest::FormRequest {
                id,
                task_id,
                title,
                fields,
                timeout_secs,
            } => (
                RequestKind::Form,
                id,
                task_id,
                timeout_secs,
                json!({ "title": title, "fields": fields }),
            ),
            BridgeRequest::FileRequest {
                id,
                task_id,
                prompt,
                timeout_secs,
            } => (
                RequestKind::File,
                id,
                task_id,
                timeout_secs,
                json!({ "prompt": prompt }),
            ),
            BridgeRequest::Unknown => {
                return Err(BridgeError::UnknownRequest("unsupported".to_string()));
            }
        };
        let timeout = timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();
        if inner.by_task.contains_key(&task_id) {
            return Err(BridgeError::TaskBusy(task_id));
        }
        if inner.pending.contains_key(&id) {
            return Err(BridgeError::DuplicateRequest(id));
        }

        let timer = {
            let bridge = Arc::clone(self);
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if bridge.finish(&id, Resolution::cancelled("timeout")).is_ok() {
                    info!(request_id = %id, "Interactive request timed out");
                }
            })
        };

        if let Some(obj) = event.as_object_mut() {
            obj.insert("type".into(), json!(kind.event_type()));
            obj.insert("request_id".into(), json!(id));
            obj.insert("task_id".into(), json!(task_id));
            obj.insert("timeout_ms".into(), json!(timeout.as_millis() as u64));
        }
        inner.by_task.insert(task_id.clone(), id.clone());
        inner.pending.insert(
            id.clone(),
            Pending {
                task_id: task_id.clone(),
                kind,
                reply: tx,
                timer: Some(timer),
            },
        );
        Self::emit(&mut inner, event);
        info!(request_id = %id, task_id = %task_id, kind = kind.event_type(), "Interactive request pending");
        Ok(rx)
    }

    /// Deliver the client's answer to a pending request.
    pub fn resolve(&self, request_id: &str, resolution: Resolution) -> Result<(), BridgeError> {
        let timer = self.finish(request_id, resolution)?;
        if let Some(timer) = timer {
            timer.abort();
        }
        Ok(())
    }

    fn finish(
        &self,
        request_id: &str,
        resolution: Resolution,
    ) -> Result<Option<JoinHandle<()>>, BridgeError> {
        let mut inner = self.lock();
        let mut pending = inner
            .pending
            .remove(request_id)
            .ok_or_else(|| BridgeError::UnknownRequest(request_id.to_string()))?;
        inner.by_task.remove(&pending.task_id);
        Self::emit(
            &mut inner,
            json!({
                "type": "input_resolved",
                "request_id": request_id,
                "task_id": pending.task_id,
                "cancelled": resolution.cancelled,
                "reason": resolution.reason,
            }),
        );
        if pending.reply.send(resolution).is_err() {
            warn!(request_id = %request_id, "Requester went away before the answer arrived");
        }
        Ok(pending.timer.take())
    }

    /// Cancel whatever the task is waiting on, if anything.
    pub fn cancel_task(&self, task_id: &str, reason: &str) -> bool {
        let id = self.lock().by_task.get(task_id).cloned();
        match id {
            Some(id) => self.resolve(&id, Resolution::cancelled(reason)).is_ok(),
            None => false,
        }
    }

    pub fn pending_for_task(&self, task_id: &str) -> Option<String> {
        self.lock().by_task.get(task_id).cloned()
    }

    pub fn kind_of(&self, request_id: &str) -> Option<RequestKind> {
        self.lock().pending.get(request_id).map(|p| p.kind)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ask(id: &str, task: &str, timeout_secs: Option<u64>) -> BridgeRequest {
        BridgeRequest::InputRequest {
            id: id.into(),
            task_id: task.into(),
            question: "Deploy now?".into(),
            options: vec!["yes".into(), "no".into()],
            timeout_secs,
        }
    }

    #[tokio::test]
    async fn answer_reaches_the_requester() {
        let bridge = LocalBridge::new(Duration::from_secs(60));
        let mut events = bridge.attach_consumer();
        let rx = bridge.register(ask("r1", "t1", None)).unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event["type"], "input_request");
        assert_eq!(event["request_id"], "r1");
        assert_eq!(event["options"], json!(["yes", "no"]));

        bridge
            .resolve("r1", Resolution::answered(json!("yes")))
            .unwrap();
        let answer = rx.await.unwrap();
        assert_eq!(answer.response, json!("yes"));
        assert!(!answer.cancelled);
        assert_eq!(events.recv().await.unwrap()["type"], "input_resolved");
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn second_request_for_same_task_is_rejected() {
        let bridge = LocalBridge::new(Duration::from_secs(60));
        let _first = bridge.register(ask("r1", "t1", None)).unwrap();
        let err = bridge.register(ask("r2", "t1", None)).unwrap_err();
        assert_eq!(err, BridgeError::TaskBusy("t1".into()));

        // Other tasks are unaffected.
        assert!(bridge.register(ask("r3", "t2", None)).is_ok());
        assert_eq!(bridge.pending_for_task("t1").as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn reused_request_id_is_rejected() {
        let bridge = LocalBridge::new(Duration::from_secs(60));
        let first = bridge.register(ask("r1", "t1", None)).unwrap();
        let err = bridge.register(ask("r1", "t2", None)).unwrap_err();
        assert_eq!(err, BridgeError::DuplicateRequest("r1".into()));
        assert_eq!(bridge.pending_for_task("t2"), None);

        bridge
            .resolve("r1", Resolution::answered(json!("ok")))
            .unwrap();
        assert_eq!(first.await.unwrap().response, json!("ok"));
        assert_eq!(bridge.pending_for_task("t1"), None);
        assert!(bridge.register(ask("r2", "t1", None)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_with_reason() {
        let bridge = LocalBridge::new(Duration::from_secs(60));
        let rx = bridge.register(ask("r1", "t1", Some(2))).unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        let answer = rx.await.unwrap();
        assert!(answer.cancelled);
        assert_eq!(answer.reason.as_deref(), Some("timeout"));
        assert_eq!(bridge.pending_for_task("t1"), None);
        assert_eq!(
            bridge.resolve("r1", Resolution::answered(json!("late"))),
            Err(BridgeError::UnknownRequest("r1".into()))
        );
    }

    #[tokio::test]
    async fn events_before_consumer_are_flushed_in_order() {
        let bridge = LocalBridge::new(Duration::from_secs(60));
        let _a = bridge.register(ask("r1", "t1", None)).unwrap();
        let _b = bridge
            .register(BridgeRequest::FileRequest {
                id: "r2".into(),
                task_id: "t2".into(),
                prompt: Some("Upload the logo".into()),
                timeout_secs: None,
            })
            .unwrap();

        let mut events = bridge.attach_consumer();
        assert_eq!(events.recv().await.unwrap()["request_id"], "r1");
        let second = events.recv().await.unwrap();
        assert_eq!(second["type"], "file_request");
        assert_eq!(second["prompt"], "Upload the logo");
        assert_eq!(bridge.kind_of("r2"), Some(RequestKind::File));
    }

    #[tokio::test]
    async fn dropped_consumer_requeues_events() {
        let bridge = LocalBridge::new(Duration::from_secs(60));
        drop(bridge.attach_consumer());
        let _a = bridge.register(ask("r1", "t1", None)).unwrap();
        let mut events = bridge.attach_consumer();
        assert_eq!(events.recv().await.unwrap()["request_id"], "r1");
    }

    #[tokio::test]
    async fn cancelling_a_task_releases_its_request() {
        let bridge = LocalBridge::new(Duration::from_secs(60));
        let rx = bridge.register(ask("r1", "t1", None)).unwrap();
        assert!(bridge.cancel_task("t1", "task_cancelled"));
        assert_eq!(rx.await.unwrap().reason.as_deref(), Some("task_cancelled"));
        assert!(!bridge.cancel_task("t1", "task_cancelled"));
    }

    #[test]
    fn reply_wire_shape() {
        let reply = BridgeReply::Response {
            id: "r1".into(),
            resolution: Resolution::cancelled("timeout"),
        };
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(
            value,
            json!({"type": "response", "id": "r1", "response": null, "cancelled": true, "reason": "timeout"})
        );
        let parsed: BridgeRequest =
            serde_json::from_value(json!({"type": "input_request", "id": "x", "task_id": "t", "question": "q"}))
                .unwrap();
        assert_eq!(parsed.id(), Some("x"));
    }
}
