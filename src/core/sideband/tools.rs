//! Function tools declared to the realtime session and the calls they decode to.

use serde::Deserialize;
use serde_json::{Value, json};

pub const RUN_TASK: &str = "run_task";
pub const GET_TASKS: &str = "get_tasks";
pub const CANCEL_TASK: &str = "cancel_task";
pub const UPDATE_TASK: &str = "update_task";

pub fn tool_definitions() -> Value {
    json!([
        {
            "type": "function",
            "name": RUN_TASK,
            "description": "Start a coding task on the user's workstation. Use for anything that needs reading or changing code, running commands or inspecting the project.",
            "parameters": {
                "type": "object",
                "properties": {
                    "task": { "type": "string", "description": "Complete, self-contained instructions for the agent." },
                    "title": { "type": "string", "description": "Three to six word label for the task." }
                },
                "required": ["task"]
            }
        },
        {
            "type": "function",
            "name": GET_TASKS,
            "description": "Report status, current tool and result of recent tasks, or of one task.",
            "parameters": {
                "type": "object",
                "properties": {
                    "task_id": { "type": "string" }
                }
            }
        },
        {
            "type": "function",
            "name": CANCEL_TASK,
            "description": "Stop a running task. Without task_id the most recent running task is stopped.",
            "parameters": {
                "type": "object",
                "properties": {
                    "task_id": { "type": "string" }
                }
            }
        },
        {
            "type": "function",
            "name": UPDATE_TASK,
            "description": "Change or follow up on a task. A running task is restarted with the new instructions in the same conversation; a finished one is continued.",
            "parameters": {
                "type": "object",
                "properties": {
                    "task_id": { "type": "string" },
                    "message": { "type": "string", "description": "New or additional instructions." },
                    "title": { "type": "string" }
                },
                "required": ["message"]
            }
        }
    ])
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    RunTask {
        task: String,
        title: Option<String>,
    },
    GetTasks {
        task_id: Option<String>,
    },
    CancelTask {
        task_id: Option<String>,
    },
    UpdateTask {
        task_id: Option<String>,
        message: String,
        title: Option<String>,
    },
    Unknown(String),
}

#[derive(Deserialize, Default)]
struct Args {
    #[serde(default)]
    task: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl ToolCall {
    /// Decode a function call. `arguments` is the raw JSON string the
    /// realtime API delivers.
    pub fn parse(name: &str, arguments: &str) -> Result<Self, String> {
        let args: Args = if arguments.trim().is_empty() {
            Args::default()
        } else {
            serde_json::from_str(arguments).map_err(|e| format!("invalid arguments: {}", e))?
        };
        let call = match name {
            RUN_TASK => ToolCall::RunTask {
                task: non_empty(args.task).ok_or("task is required")?,
                title: non_empty(args.title),
            },
            GET_TASKS => ToolCall::GetTasks {
                task_id: non_empty(args.task_id),
            },
            CANCEL_TASK => ToolCall::CancelTask {
                task_id: non_empty(args.task_id),
            },
            UPDATE_TASK => ToolCall::UpdateTask {
                task_id: non_empty(args.task_id),
                message: non_empty(args.message).ok_or("message is required")?,
                title: non_empty(args.title),
            },
            other => ToolCall::Unknown(other.to_string()),
        };
        Ok(call)
    }
}
