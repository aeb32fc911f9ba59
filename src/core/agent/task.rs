use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::state::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    Error,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::Error
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub status: ToolStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub description: String,
    pub title: Option<String>,
    pub status: TaskStatus,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub duration_ms: Option<u64>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub thread_id: Option<String>,
    pub current_tool: Option<String>,
    pub tool_history: Vec<ToolInvocation>,
}

impl TaskRecord {
    pub fn new(id: impl Into<String>, description: impl Into<String>, title: Option<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            title,
            status: TaskStatus::Pending,
            created_at: now_ms(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            result: None,
            error: None,
            thread_id: None,
            current_tool: None,
            tool_history: Vec::new(),
        }
    }

    pub fn start(&mut self) {
        if self.status == TaskStatus::Pending {
            self.status = TaskStatus::Running;
            self.started_at = Some(now_ms());
        }
    }

    /// Record a new tool call. Any call still running is closed first so only
    /// one invocation is ever open.
    pub fn tool_use(&mut self, id: &str, name: &str, input: Value) {
        if self.status.is_terminal() {
            return;
        }
        self.start();
        self.close_running(ToolStatus::Completed);
        self.tool_history.push(ToolInvocation {
            id: id.to_string(),
            name: name.to_string(),
            input,
            started_at: now_ms(),
            completed_at: None,
            status: ToolStatus::Running,
        });
        self.current_tool = Some(name.to_string());
    }

    pub fn tool_result(&mut self, id: &str, is_error: bool) {
        let Some(tool) = self
            .tool_history
            .iter_mut()
            .rev()
            .find(|t| t.id == id && t.status == ToolStatus::Running)
        else {
            return;
        };
        tool.status = if is_error {
            ToolStatus::Error
        } else {
            ToolStatus::Completed
        };
        tool.completed_at = Some(now_ms());
        if self.current_tool.as_deref() == Some(tool.name.as_str()) {
            self.current_tool = None;
        }
    }

    fn close_running(&mut self, status: ToolStatus) {
        let now = now_ms();
        for tool in self
            .tool_history
            .iter_mut()
            .filter(|t| t.status == ToolStatus::Running)
        {
            tool.status = status;
            tool.completed_at = Some(now);
        }
        self.current_tool = None;
    }

    fn finish(&mut self, status: TaskStatus, duration_ms: u64, tool_status: ToolStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.close_running(tool_status);
        self.status = status;
        self.completed_at = Some(now_ms());
        self.duration_ms = Some(duration_ms);
        true
    }

    pub fn complete(&mut self, result: String, duration_ms: u64) -> bool {
        let changed = self.finish(TaskStatus::Completed, duration_ms, ToolStatus::Completed);
        if changed {
            self.result = Some(result);
        }
        changed
    }

    pub fn fail(&mut self, message: String, duration_ms: u64) -> bool {
        let changed = self.finish(TaskStatus::Error, duration_ms, ToolStatus::Error);
        if changed {
            self.error = Some(message);
        }
        changed
    }

    pub fn cancel(&mut self, duration_ms: u64) -> bool {
        self.finish(TaskStatus::Cancelled, duration_ms, ToolStatus::Error)
    }

    /// Display label: the title when given, otherwise the description.
    pub fn label(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.description)
    }
}
