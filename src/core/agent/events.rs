use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One decoded item from an agent's line-delimited JSON stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    SessionStarted {
        thread_id: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        id: String,
        is_error: bool,
    },
    Delta {
        text: String,
    },
    Result {
        text: String,
        is_error: bool,
        thread_id: Option<String>,
    },
}

/// Canonical events every agent variant is mapped onto. `Done`, `Error` and
/// `Cancelled` are terminal: exactly one of them ends every task stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    ToolUse {
        task_id: String,
        tool_id: String,
        name: String,
        input: Value,
    },
    Delta {
        task_id: String,
        text: String,
    },
    Done {
        task_id: String,
        result: String,
        duration_ms: u64,
        #[serde(default)]
        thread_id: Option<String>,
    },
    Error {
        task_id: String,
        message: String,
        duration_ms: u64,
    },
    Cancelled {
        task_id: String,
        duration_ms: u64,
    },
}

impl AgentEvent {
    pub fn task_id(&self) -> &str {
        match self {
            AgentEvent::ToolUse { task_id, .. }
            | AgentEvent::Delta { task_id, .. }
            | AgentEvent::Done { task_id, .. }
            | AgentEvent::Error { task_id, .. }
            | AgentEvent::Cancelled { task_id, .. } => task_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentEvent::Done { .. } | AgentEvent::Error { .. } | AgentEvent::Cancelled { .. }
        )
    }

    pub fn status(&self) -> &'static str {
        match self {
            AgentEvent::ToolUse { .. } | AgentEvent::Delta { .. } => "running",
            AgentEvent::Done { .. } => "completed",
            AgentEvent::Error { .. } => "error",
            AgentEvent::Cancelled { .. } => "cancelled",
        }
    }
}
