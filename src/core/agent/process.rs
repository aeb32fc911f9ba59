//! One agent slot: runs a CLI agent subprocess per task, remembers the
//! conversation thread between runs and keeps a short task history.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{AgentEvent, ParsedLine};
use super::plugin::AgentPlugin;
use super::pool::PoolSettings;
use super::task::TaskRecord;
use crate::platform::{NativePlatform, Platform};

pub type SharedTask = Arc<Mutex<TaskRecord>>;

const STDERR_TAIL: usize = 4000;

struct ProcessState {
    busy: bool,
    running: bool,
    last_active: Instant,
    thread_id: Option<String>,
    current_task: Option<String>,
    cancel: Option<CancellationToken>,
    tasks: VecDeque<SharedTask>,
}

enum Outcome {
    Done(String),
    Error(String),
    Cancelled,
}

/// Fans each event out to the task's own stream and the pool-wide bus.
struct Emitter {
    tx: mpsc::UnboundedSender<AgentEvent>,
    bus: broadcast::Sender<AgentEvent>,
}

impl Emitter {
    fn send(&self, event: AgentEvent) {
        let _ = self.bus.send(event.clone());
        let _ = self.tx.send(event);
    }
}

pub struct AgentProcess {
    id: u64,
    plugin: Arc<dyn AgentPlugin>,
    settings: Arc<PoolSettings>,
    state: Mutex<ProcessState>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AgentProcess {
    pub fn new(id: u64, plugin: Arc<dyn AgentPlugin>, settings: Arc<PoolSettings>) -> Self {
        Self {
            id,
            plugin,
            settings,
            state: Mutex::new(ProcessState {
                busy: false,
                running: false,
                last_active: Instant::now(),
                thread_id: None,
                current_task: None,
                cancel: None,
                tasks: VecDeque::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Claim the slot for a new task. Returns `false` when already busy.
    pub fn try_reserve(&self) -> bool {
        let mut st = lock(&self.state);
        if st.busy {
            return false;
        }
        st.busy = true;
        true
    }

    pub fn release(&self) {
        let mut st = lock(&self.state);
        st.busy = false;
        st.last_active = Instant::now();
    }

    pub fn is_busy(&self) -> bool {
        lock(&self.state).busy
    }

    pub fn idle_for(&self) -> Duration {
        lock(&self.state).last_active.elapsed()
    }

    pub fn thread_id(&self) -> Option<String> {
        lock(&self.state).thread_id.clone()
    }

    pub fn current_task(&self) -> Option<String> {
        lock(&self.state).current_task.clone()
    }

    pub fn tasks(&self) -> Vec<SharedTask> {
        lock(&self.state).tasks.iter().cloned().collect()
    }

    pub fn task(&self, task_id: &str) -> Option<SharedTask> {
        lock(&self.state)
            .tasks
            .iter()
            .find(|t| lock(t).id == task_id)
            .cloned()
    }

    /// Start `record` on this (already reserved) slot. Events arrive on the
    /// returned stream, which always ends with one terminal event.
    pub fn execute(
        self: &Arc<Self>,
        record: TaskRecord,
        resume: Option<String>,
        bus: broadcast::Sender<AgentEvent>,
    ) -> (SharedTask, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task: SharedTask = Arc::new(Mutex::new(record));
        let cancel = CancellationToken::new();
        {
            let mut st = lock(&self.state);
            st.busy = true;
            st.current_task = Some(lock(&task).id.clone());
            st.cancel = Some(cancel.clone());
            st.tasks.push_back(task.clone());
            while st.tasks.len() > self.settings.task_history.max(1) {
                st.tasks.pop_front();
            }
        }

        let this = Arc::clone(self);
        let run_task = task.clone();
        tokio::spawn(async move {
            this.run(run_task, resume, cancel, Emitter { tx, bus }).await;
        });
        (task, rx)
    }

    /// Kill the running subprocess, if any. Returns whether a task was running.
    pub fn cancel(&self) -> bool {
        let st = lock(&self.state);
        match (&st.cancel, st.busy) {
            (Some(token), true) => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn stop(&self) {
        let mut st = lock(&self.state);
        if let Some(token) = st.cancel.take() {
            token.cancel();
        }
        st.running = false;
    }

    async fn run(
        self: Arc<Self>,
        task: SharedTask,
        resume: Option<String>,
        cancel: CancellationToken,
        emitter: Emitter,
    ) {
        let started = Instant::now();
        let (task_id, description) = {
            let mut t = lock(&task);
            t.start();
            (t.id.clone(), t.description.clone())
        };
        info!(task_id = %task_id, process = self.id, agent = self.plugin.name(), "Task started");

        let outcome = self
            .drive(&task, &task_id, &description, resume.clone(), &cancel, &emitter)
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let thread_id = {
            let mut t = lock(&task);
            if t.thread_id.is_none() {
                t.thread_id = resume;
            }
            match &outcome {
                Outcome::Done(result) => t.complete(result.clone(), duration_ms),
                Outcome::Error(message) => t.fail(message.clone(), duration_ms),
                Outcome::Cancelled => t.cancel(duration_ms),
            };
            t.thread_id.clone()
        };

        {
            let mut st = lock(&self.state);
            st.busy = false;
            st.running = false;
            st.current_task = None;
            st.cancel = None;
            st.last_active = Instant::now();
            if thread_id.is_some() {
                st.thread_id = thread_id.clone();
            }
        }

        let terminal = match outcome {
            Outcome::Done(result) => {
                info!(task_id = %task_id, duration_ms, "Task completed");
                AgentEvent::Done {
                    task_id,
                    result,
                    duration_ms,
                    thread_id,
                }
            }
            Outcome::Error(message) => {
                warn!(task_id = %task_id, duration_ms, "Task failed: {}", message);
                AgentEvent::Error {
                    task_id,
                    message,
                    duration_ms,
                }
            }
            Outcome::Cancelled => {
                info!(task_id = %task_id, duration_ms, "Task cancelled");
                AgentEvent::Cancelled {
                    task_id,
                    duration_ms,
                }
            }
        };
        emitter.send(terminal);
    }

    async fn drive(
        &self,
        task: &SharedTask,
        task_id: &str,
        description: &str,
        resume: Option<String>,
        cancel: &CancellationToken,
        emitter: &Emitter,
    ) -> Outcome {
        let (program, args) = self.plugin.command(resume.as_deref());
        let mut cmd = NativePlatform::agent_command(&program);
        cmd.args(&args)
            .current_dir(&self.settings.workdir)
            .env("VOICEPILOT_TASK_ID", task_id)
            .env("VOICEPILOT_BRIDGE_PORT", self.settings.bridge_port.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(task_id = %task_id, program = %program, ?args, "Spawning agent");
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => return Outcome::Error(format!("failed to start {}: {}", program, e)),
        };
        lock(&self.state).running = true;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = self.plugin.stdin_payload(description);
            if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                warn!(task_id = %task_id, "Failed to write task to agent stdin: {}", e);
            }
            // Dropping stdin closes it so the agent starts working.
        }

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                let text = String::from_utf8_lossy(&buf).trim().to_string();
                let cut = text.char_indices().rev().nth(STDERR_TAIL).map(|(i, _)| i);
                match cut {
                    Some(cut) => text[cut..].to_string(),
                    None => text,
                }
            })
        });

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill().await;
            return Outcome::Error("agent stdout unavailable".to_string());
        };
        let mut lines = BufReader::new(stdout).lines();
        let mut result: Option<(String, bool)> = None;
        let mut transcript = String::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Outcome::Cancelled;
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        for parsed in self.plugin.parse_line(&line) {
                            self.apply(task, task_id, parsed, emitter, &mut transcript, &mut result);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(task_id = %task_id, "Agent stdout read failed: {}", e);
                        break;
                    }
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Outcome::Cancelled;
            }
            status = child.wait() => status,
        };
        let stderr = match stderr_task {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        match status {
            Ok(s) if s.success() => match result {
                Some((text, true)) => Outcome::Error(text),
                Some((text, false)) => Outcome::Done(text),
                None => Outcome::Done(transcript.trim().to_string()),
            },
            Ok(s) => {
                let message = if !stderr.is_empty() {
                    stderr
                } else if let Some((text, _)) = result {
                    text
                } else {
                    format!("agent exited with {}", s)
                };
                Outcome::Error(message)
            }
            Err(e) => Outcome::Error(format!("failed waiting for agent: {}", e)),
        }
    }

    fn apply(
        &self,
        task: &SharedTask,
        task_id: &str,
        parsed: ParsedLine,
        emitter: &Emitter,
        transcript: &mut String,
        result: &mut Option<(String, bool)>,
    ) {
        match parsed {
            ParsedLine::SessionStarted { thread_id } => {
                lock(task).thread_id = Some(thread_id.clone());
                lock(&self.state).thread_id = Some(thread_id);
            }
            ParsedLine::ToolUse { id, name, input } => {
                lock(task).tool_use(&id, &name, input.clone());
                emitter.send(AgentEvent::ToolUse {
                    task_id: task_id.to_string(),
                    tool_id: id,
                    name,
                    input,
                });
            }
            ParsedLine::ToolResult { id, is_error } => {
                lock(task).tool_result(&id, is_error);
            }
            ParsedLine::Delta { text } => {
                if !transcript.is_empty() {
                    transcript.push('\n');
                }
                transcript.push_str(&text);
                emitter.send(AgentEvent::Delta {
                    task_id: task_id.to_string(),
                    text,
                });
            }
            ParsedLine::Result {
                text,
                is_error,
                thread_id,
            } => {
                if let Some(id) = thread_id {
                    lock(task).thread_id = Some(id);
                }
                *result = Some((text, is_error));
            }
        }
    }
}
