//! JSON envelopes exchanged over the relay sockets. Every message is an
//! object with a `type` tag; unknown tags decode to `Unknown` so a newer peer
//! never breaks an older one.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Types the hub may deliver to the worker.
pub const WEB_TO_WORKER: &[&str] = &[
    "connected",
    "connect_call",
    "input_response",
    "cancel_task",
    "retry_task",
    "file_upload_start",
    "file_upload_chunk",
    "heartbeat_ack",
];

/// Client types the hub forwards to the worker untouched.
pub const CLIENT_TO_WORKER: &[&str] = &["input_response", "file_upload_start", "file_upload_chunk"];

pub fn message_type(value: &Value) -> Option<&str> {
    value.get("type").and_then(Value::as_str)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceInfo {
    pub hostname: String,
    pub workdir: String,
    pub agent: String,
    pub max_workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub task_id: String,
    pub status: String,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

/// Worker → hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    WorkspaceInfo(WorkspaceInfo),
    TaskResult(TaskResult),
    AgentEvent { event: Value },
    ClientEvent { event: Value },
    Heartbeat,
    RequestActiveCall,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileUploadStart {
    pub file_id: String,
    pub name: String,
    pub total_chunks: u32,
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileUploadChunk {
    pub file_id: String,
    pub index: u32,
    /// Base64 chunk bytes.
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputResponse {
    pub request_id: String,
    #[serde(default)]
    pub response: Value,
    #[serde(default)]
    pub cancelled: bool,
}

/// Hub → worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubToWorker {
    Connected {
        worker_id: String,
    },
    ConnectCall {
        call_id: String,
        ephemeral_key: String,
    },
    InputResponse(InputResponse),
    CancelTask {
        #[serde(default)]
        task_id: Option<String>,
    },
    RetryTask {
        task_id: String,
    },
    FileUploadStart(FileUploadStart),
    FileUploadChunk(FileUploadChunk),
    HeartbeatAck,
    #[serde(other)]
    Unknown,
}

/// Client → hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    InputResponse(InputResponse),
    FileUploadStart(FileUploadStart),
    FileUploadChunk(FileUploadChunk),
    Heartbeat,
    CallHeartbeat {
        call_id: String,
        #[serde(default)]
        ephemeral_key: Option<String>,
        #[serde(default = "default_true")]
        active: bool,
    },
    #[serde(other)]
    Unknown,
}

fn default_true() -> bool {
    true
}

pub fn to_text<T: Serialize>(msg: &T) -> String {
    serde_json::to_string(msg).unwrap_or_else(|_| "{}".to_string())
}
