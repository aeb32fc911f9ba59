//! Bounded pool of agent slots. Routes cancel/update/resume to the slot that
//! owns a task or thread and retires slots that sit idle.

use anyhow::{Result, bail};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use super::events::AgentEvent;
use super::plugin::AgentPlugin;
use super::process::{AgentProcess, SharedTask};
use super::task::TaskRecord;
use crate::core::config::WorkerConfig;

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_workers: usize,
    pub idle_timeout: Duration,
    pub poll_interval: Duration,
    pub workdir: PathBuf,
    pub bridge_port: u16,
    pub task_history: usize,
}

impl PoolSettings {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            max_workers: config.max_workers.max(1),
            idle_timeout: config.idle_timeout(),
            poll_interval: config.poll_interval(),
            workdir: config.resolved_workdir(),
            bridge_port: config.bridge_port,
            task_history: config.task_history.max(1),
        }
    }
}

/// A started task: its id plus the stream of its events.
pub struct TaskHandle {
    pub task_id: String,
    pub events: UnboundedReceiverStream<AgentEvent>,
}

#[derive(Default)]
struct PoolInner {
    processes: Vec<Arc<AgentProcess>>,
    task_process: HashMap<String, Arc<AgentProcess>>,
    task_thread: HashMap<String, String>,
    order: VecDeque<String>,
    retired: VecDeque<SharedTask>,
}

pub struct AgentPool {
    plugin: Arc<dyn AgentPlugin>,
    settings: Arc<PoolSettings>,
    inner: Mutex<PoolInner>,
    bus: broadcast::Sender<AgentEvent>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

fn snapshot(task: &SharedTask) -> TaskRecord {
    task.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

fn new_task_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("t-{}", &id[..8])
}

impl AgentPool {
    pub fn new(plugin: Arc<dyn AgentPlugin>, settings: PoolSettings) -> Arc<Self> {
        let (bus, _) = broadcast::channel(512);
        Arc::new(Self {
            plugin,
            settings: Arc::new(settings),
            inner: Mutex::new(PoolInner::default()),
            bus,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn agent_name(&self) -> &'static str {
        self.plugin.name()
    }

    /// Every event from every task, for relaying.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.bus.subscribe()
    }

    /// Start a task. Waits, polling, while every slot is busy and the pool is
    /// at capacity.
    pub async fn execute(
        &self,
        description: &str,
        title: Option<String>,
        resume_thread: Option<String>,
    ) -> Result<TaskHandle> {
        let task_id = new_task_id();
        loop {
            if self.closed.load(Ordering::SeqCst) {
                bail!("agent pool is shut down");
            }
            {
                let mut inner = self.inner.lock().await;
                if let Some(process) = self.pick(&mut inner, resume_thread.as_deref()) {
                    inner.task_process.insert(task_id.clone(), process.clone());
                    if let Some(thread) = &resume_thread {
                        inner.task_thread.insert(task_id.clone(), thread.clone());
                    }
                    inner.order.push_back(task_id.clone());
                    while inner.order.len() > self.settings.task_history * self.settings.max_workers {
                        if let Some(old) = inner.order.pop_front() {
                            inner.task_process.remove(&old);
                            inner.task_thread.remove(&old);
                        }
                    }

                    let record = TaskRecord::new(task_id.clone(), description, title);
                    let (_, rx) = process.execute(record, resume_thread, self.bus.clone());
                    debug!(task_id = %task_id, process = process.id(), "Task dispatched");
                    return Ok(TaskHandle {
                        task_id,
                        events: UnboundedReceiverStream::new(rx),
                    });
                }
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Reserve an idle slot, preferring the one already holding `thread`, or
    /// open a new one while under the cap.
    fn pick(&self, inner: &mut PoolInner, thread: Option<&str>) -> Option<Arc<AgentProcess>> {
        if let Some(thread) = thread
            && let Some(p) = inner
                .processes
                .iter()
                .find(|p| p.thread_id().as_deref() == Some(thread) && p.try_reserve())
        {
            return Some(p.clone());
        }
        if let Some(p) = inner.processes.iter().find(|p| p.try_reserve()) {
            return Some(p.clone());
        }
        if inner.processes.len() < self.settings.max_workers {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let process = Arc::new(AgentProcess::new(
                id,
                self.plugin.clone(),
                self.settings.clone(),
            ));
            process.try_reserve();
            inner.processes.push(process.clone());
            info!(process = id, total = inner.processes.len(), "Agent process opened");
            return Some(process);
        }
        None
    }

    pub async fn resume(
        &self,
        thread_id: &str,
        message: &str,
        title: Option<String>,
    ) -> Result<TaskHandle> {
        self.execute(message, title, Some(thread_id.to_string()))
            .await
    }

    /// The newest task that is still running.
    pub async fn most_recent_busy_task(&self) -> Option<String> {
        let inner = self.inner.lock().await;
        inner
            .order
            .iter()
            .rev()
            .find(|id| {
                inner
                    .task_process
                    .get(*id)
                    .is_some_and(|p| p.current_task().as_deref() == Some(id.as_str()))
            })
            .cloned()
    }

    async fn most_recent_task(&self) -> Option<String> {
        self.inner.lock().await.order.back().cloned()
    }

    /// Cancel `task_id`, or the newest running task. Returns the cancelled id.
    pub async fn cancel(&self, task_id: Option<&str>) -> Option<String> {
        let target = match task_id {
            Some(id) => id.to_string(),
            None => self.most_recent_busy_task().await?,
        };
        let process = self.inner.lock().await.task_process.get(&target).cloned()?;
        if process.current_task().as_deref() == Some(target.as_str()) && process.cancel() {
            info!(task_id = %target, "Cancelling task");
            Some(target)
        } else {
            None
        }
    }

    /// Thread a task ran on, when the agent reported one.
    pub async fn thread_of(&self, task_id: &str) -> Option<String> {
        if let Some(record) = self.get_task(task_id).await
            && record.thread_id.is_some()
        {
            return record.thread_id;
        }
        self.inner.lock().await.task_thread.get(task_id).cloned()
    }

    /// Redirect a task: a running one is cancelled and restarted on its thread
    /// with `message`; a finished one has its thread resumed.
    pub async fn update(
        &self,
        task_id: Option<&str>,
        message: &str,
        title: Option<String>,
    ) -> Result<(String, TaskHandle)> {
        let target = match task_id {
            Some(id) => Some(id.to_string()),
            None => match self.most_recent_busy_task().await {
                Some(id) => Some(id),
                None => self.most_recent_task().await,
            },
        };
        let Some(target) = target else {
            bail!("there is no task to update");
        };
        if self.get_task(&target).await.is_none() {
            bail!("unknown task '{}'", target);
        }

        if self.cancel(Some(&target)).await.is_some() {
            self.wait_until_finished(&target).await;
        }
        let thread = self.thread_of(&target).await;
        let title = match title {
            Some(t) => Some(t),
            None => self.get_task(&target).await.and_then(|t| t.title),
        };
        let handle = self.execute(message, title, thread).await?;
        info!(from = %target, to = %handle.task_id, "Task updated");
        Ok((target, handle))
    }

    async fn wait_until_finished(&self, task_id: &str) {
        for _ in 0..200 {
            match self.get_task(task_id).await {
                Some(t) if !t.status.is_terminal() => {
                    tokio::time::sleep(self.settings.poll_interval.min(Duration::from_millis(50)))
                        .await
                }
                _ => return,
            }
        }
    }

    pub async fn get_task(&self, task_id: &str) -> Option<TaskRecord> {
        let inner = self.inner.lock().await;
        if let Some(task) = inner
            .task_process
            .get(task_id)
            .and_then(|p| p.task(task_id))
        {
            return Some(snapshot(&task));
        }
        inner
            .retired
            .iter()
            .map(snapshot)
            .find(|t| t.id == task_id)
    }

    /// Recent tasks across live and retired slots, oldest first.
    pub async fn get_tasks(&self) -> Vec<TaskRecord> {
        let inner = self.inner.lock().await;
        let mut tasks: Vec<TaskRecord> = inner
            .processes
            .iter()
            .flat_map(|p| p.tasks())
            .chain(inner.retired.iter().cloned())
            .map(|t| snapshot(&t))
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub async fn active_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.processes.iter().filter(|p| p.is_busy()).count()
    }

    pub async fn process_count(&self) -> usize {
        self.inner.lock().await.processes.len()
    }

    /// Stop slots idle beyond the timeout. Busy slots are never touched.
    pub async fn cleanup_idle_workers(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let timeout = self.settings.idle_timeout;
        let (stale, live): (Vec<_>, Vec<_>) = inner
            .processes
            .drain(..)
            .partition(|p| !p.is_busy() && p.idle_for() > timeout);
        inner.processes = live;

        let cap = self.settings.task_history * self.settings.max_workers;
        for process in &stale {
            process.stop();
            inner.retired.extend(process.tasks());
            while inner.retired.len() > cap {
                inner.retired.pop_front();
            }
        }
        if !stale.is_empty() {
            info!(stopped = stale.len(), "Stopped idle agent processes");
        }
        stale.len()
    }

    /// Cancel everything and refuse new work.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let processes: Vec<_> = self.inner.lock().await.processes.clone();
        for p in &processes {
            p.cancel();
        }
        for _ in 0..100 {
            if processes.iter().all(|p| !p.is_busy()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        for p in &processes {
            p.stop();
        }
        self.inner.lock().await.processes.clear();
        info!("Agent pool stopped");
    }
}
