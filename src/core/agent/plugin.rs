//! Per-agent command lines and stream parsers.
//!
//! Both supported agents print one JSON object per line in the Claude
//! `stream-json` shape (`system` / `assistant` / `user` / `result`). They
//! differ in how they are invoked, how a thread is resumed and in a few
//! field names, which is all a plugin has to describe.

use anyhow::{Result, bail};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use super::events::ParsedLine;

pub trait AgentPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Program and arguments for one run, resuming `thread_id` when given.
    fn command(&self, thread_id: Option<&str>) -> (String, Vec<String>);

    /// Bytes written to the subprocess stdin before it is closed.
    fn stdin_payload(&self, task: &str) -> String {
        task.to_string()
    }

    fn parse_line(&self, line: &str) -> Vec<ParsedLine>;
}

pub fn plugin_for(name: &str) -> Result<Arc<dyn AgentPlugin>> {
    match name.trim().to_ascii_lowercase().as_str() {
        "claude" => Ok(Arc::new(ClaudePlugin)),
        "amp" => Ok(Arc::new(AmpPlugin)),
        other => bail!("unknown agent '{}' (expected claude or amp)", other),
    }
}

pub struct ClaudePlugin;

impl AgentPlugin for ClaudePlugin {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn command(&self, thread_id: Option<&str>) -> (String, Vec<String>) {
        let mut args: Vec<String> = ["-p", "--output-format", "stream-json", "--verbose"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if let Some(id) = thread_id {
            args.push("--resume".to_string());
            args.push(id.to_string());
        }
        ("claude".to_string(), args)
    }

    fn parse_line(&self, line: &str) -> Vec<ParsedLine> {
        parse_stream_json(line)
    }
}

pub struct AmpPlugin;

impl AgentPlugin for AmpPlugin {
    fn name(&self) -> &'static str {
        "amp"
    }

    fn command(&self, thread_id: Option<&str>) -> (String, Vec<String>) {
        let mut args = Vec::new();
        if let Some(id) = thread_id {
            args.extend(["threads", "continue", id].iter().map(|s| s.to_string()));
        }
        args.extend(["--execute", "--stream-json"].iter().map(|s| s.to_string()));
        ("amp".to_string(), args)
    }

    fn parse_line(&self, line: &str) -> Vec<ParsedLine> {
        let mut parsed = parse_stream_json(line);
        // Amp reports failures in `error` rather than `result`.
        if parsed.is_empty()
            && let Ok(value) = serde_json::from_str::<Value>(line)
            && value.get("type").and_then(Value::as_str) == Some("result")
            && let Some(err) = value.get("error").and_then(Value::as_str)
        {
            parsed.push(ParsedLine::Result {
                text: err.to_string(),
                is_error: true,
                thread_id: str_field(&value, THREAD_KEY),
            });
        }
        parsed
    }
}

/// Field carrying the resumable conversation id in `stream-json` output.
const THREAD_KEY: &str = "session_id";

fn str_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// Decode one `stream-json` line. Unknown or malformed lines yield nothing.
pub(crate) fn parse_stream_json(line: &str) -> Vec<ParsedLine> {
    let line = line.trim();
    if line.is_empty() {
        return Vec::new();
    }
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => {
            debug!(line = %line, "Non-JSON line from agent");
            return Vec::new();
        }
    };

    let mut out = Vec::new();
    match value.get("type").and_then(Value::as_str) {
        Some("system") => {
            if value.get("subtype").and_then(Value::as_str) == Some("init")
                && let Some(thread_id) = str_field(&value, THREAD_KEY)
            {
                out.push(ParsedLine::SessionStarted { thread_id });
            }
        }
        Some("assistant") => {
            for block in content_blocks(&value) {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = str_field(block, "text") {
                            out.push(ParsedLine::Delta { text });
                        }
                    }
                    Some("tool_use") => out.push(ParsedLine::ToolUse {
                        id: str_field(block, "id").unwrap_or_default(),
                        name: str_field(block, "name").unwrap_or_else(|| "tool".to_string()),
                        input: block.get("input").cloned().unwrap_or(Value::Null),
                    }),
                    _ => {}
                }
            }
        }
        Some("user") => {
            for block in content_blocks(&value) {
                if block.get("type").and_then(Value::as_str) == Some("tool_result") {
                    out.push(ParsedLine::ToolResult {
                        id: str_field(block, "tool_use_id").unwrap_or_default(),
                        is_error: block
                            .get("is_error")
                            .and_then(Value::as_bool)
                            .unwrap_or(false),
                    });
                }
            }
        }
        Some("result") => {
            if let Some(text) = value.get("result").and_then(Value::as_str) {
                out.push(ParsedLine::Result {
                    text: text.to_string(),
                    is_error: value
                        .get("is_error")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                    thread_id: str_field(&value, THREAD_KEY),
                });
            }
        }
        _ => {}
    }
    out
}

fn content_blocks(value: &Value) -> impl Iterator<Item = &Value> {
    value
        .pointer("/message/content")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn claude_command_resumes_threads() {
        let (program, args) = ClaudePlugin.command(None);
        assert_eq!(program, "claude");
        assert!(args.contains(&"stream-json".to_string()));
        assert!(!args.contains(&"--resume".to_string()));

        let (_, args) = ClaudePlugin.command(Some("abc"));
        let i = args.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(args[i + 1], "abc");
    }

    #[test]
    fn amp_command_continues_thread() {
        let (program, args) = AmpPlugin.command(Some("T-1"));
        assert_eq!(program, "amp");
        assert_eq!(&args[..3], &["threads", "continue", "T-1"]);
        assert!(args.contains(&"--stream-json".to_string()));
    }

    #[test]
    fn parses_init_assistant_user_and_result() {
        let p = ClaudePlugin;
        assert_eq!(
            p.parse_line(r#"{"type":"system","subtype":"init","session_id":"s-1"}"#),
            vec![ParsedLine::SessionStarted {
                thread_id: "s-1".into()
            }]
        );

        let assistant = json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "text", "text": "Looking"},
                {"type": "tool_use", "id": "tu1", "name": "Bash", "input": {"command": "ls"}}
            ]}
        });
        assert_eq!(
            p.parse_line(&assistant.to_string()),
            vec![
                ParsedLine::Delta {
                    text: "Looking".into()
                },
                ParsedLine::ToolUse {
                    id: "tu1".into(),
                    name: "Bash".into(),
                    input: json!({"command": "ls"})
                }
            ]
        );

        let user = json!({
            "type": "user",
            "message": {"content": [{"type": "tool_result", "tool_use_id": "tu1", "is_error": true, "content": "nope"}]}
        });
        assert_eq!(
            p.parse_line(&user.to_string()),
            vec![ParsedLine::ToolResult {
                id: "tu1".into(),
                is_error: true
            }]
        );

        assert_eq!(
            p.parse_line(r#"{"type":"result","subtype":"success","result":"ok","is_error":false,"session_id":"s-1"}"#),
            vec![ParsedLine::Result {
                text: "ok".into(),
                is_error: false,
                thread_id: Some("s-1".into())
            }]
        );
    }

    #[test]
    fn garbage_lines_are_skipped() {
        assert!(ClaudePlugin.parse_line("").is_empty());
        assert!(ClaudePlugin.parse_line("warning: something").is_empty());
        assert!(ClaudePlugin.parse_line(r#"{"type":"telemetry"}"#).is_empty());
    }

    #[test]
    fn amp_error_results() {
        assert_eq!(
            AmpPlugin.parse_line(r#"{"type":"result","error":"rate limited","session_id":"T-9"}"#),
            vec![ParsedLine::Result {
                text: "rate limited".into(),
                is_error: true,
                thread_id: Some("T-9".into())
            }]
        );
    }

    #[test]
    fn plugin_lookup() {
        assert_eq!(plugin_for("Claude").unwrap().name(), "claude");
        assert_eq!(plugin_for("amp").unwrap().name(), "amp");
        assert!(plugin_for("cursor").is_err());
    }
}
