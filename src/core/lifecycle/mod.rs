//! Ordered start/stop of the long-running pieces of a role (relay server or
//! worker) plus the periodic maintenance jobs that run alongside them.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Init,
    Start,
    Ready,
    Shutdown,
}

#[async_trait::async_trait]
pub trait LifecycleComponent {
    /// Load or obtain whatever the component needs before anything starts.
    async fn on_init(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_start(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

pub type SharedComponent = Arc<Mutex<dyn LifecycleComponent + Send + Sync>>;

pub struct LifecycleManager {
    state: LifecycleState,
    components: Vec<(&'static str, SharedComponent)>,
    started: usize,
    scheduler: JobScheduler,
}

impl LifecycleManager {
    pub async fn new() -> Result<Self> {
        Ok(Self {
            state: LifecycleState::Init,
            components: Vec::new(),
            started: 0,
            scheduler: JobScheduler::new().await?,
        })
    }

    pub fn attach(&mut self, name: &'static str, component: SharedComponent) {
        self.components.push((name, component));
    }

    /// Register a repeating job that runs `f` every `period` once started.
    pub async fn every<F, Fut>(&self, period: Duration, f: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let f = Arc::new(f);
        let job = Job::new_repeated_async(period, move |_uuid, _lock| {
            let f = f.clone();
            Box::pin(async move { f().await })
        })?;
        self.scheduler.add(job).await?;
        Ok(())
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Init every component, then start them in attach order. A failed start
    /// stops the components that already came up before returning the error.
    pub async fn start(&mut self) -> Result<()> {
        self.state = LifecycleState::Init;
        for (name, comp) in &self.components {
            debug!(component = *name, "Init");
            comp.lock()
                .await
                .on_init()
                .await
                .with_context(|| format!("{} failed to initialise", name))?;
        }

        self.state = LifecycleState::Start;
        for i in 0..self.components.len() {
            let (name, comp) = self.components[i].clone();
            let result = comp.lock().await.on_start().await;
            if let Err(e) = result {
                warn!(component = name, "Start failed, rolling back");
                self.stop_started().await;
                self.state = LifecycleState::Shutdown;
                return Err(e.context(format!("{} failed to start", name)));
            }
            self.started += 1;
            info!(component = name, "Started");
        }

        self.scheduler.start().await?;
        self.state = LifecycleState::Ready;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down");
        self.state = LifecycleState::Shutdown;
        if let Err(e) = self.scheduler.shutdown().await {
            warn!("Scheduler shutdown error: {}", e);
        }
        self.stop_started().await;
        Ok(())
    }

    /// Reverse order, so later components can still lean on earlier ones.
    async fn stop_started(&mut self) {
        for (name, comp) in self.components[..self.started].iter().rev() {
            if let Err(e) = comp.lock().await.on_shutdown().await {
                warn!(component = name, "Shutdown error: {}", e);
            }
        }
        self.started = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct Recorder {
        name: &'static str,
        log: Arc<StdMutex<Vec<String>>>,
        fail_start: bool,
    }

    impl Recorder {
        fn shared(
            name: &'static str,
            log: &Arc<StdMutex<Vec<String>>>,
            fail_start: bool,
        ) -> SharedComponent {
            Arc::new(Mutex::new(Self {
                name,
                log: log.clone(),
                fail_start,
            }))
        }

        fn push(&self, event: &str) {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, event));
        }
    }

    #[async_trait::async_trait]
    impl LifecycleComponent for Recorder {
        async fn on_init(&mut self) -> Result<()> {
            self.push("init");
            Ok(())
        }
        async fn on_start(&mut self) -> Result<()> {
            if self.fail_start {
                anyhow::bail!("port in use");
            }
            self.push("start");
            Ok(())
        }
        async fn on_shutdown(&mut self) -> Result<()> {
            self.push("stop");
            Ok(())
        }
    }

    #[tokio::test]
    async fn starts_in_order_and_stops_in_reverse() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let mut manager = LifecycleManager::new().await.unwrap();
        manager.attach("relay", Recorder::shared("relay", &log, false));
        manager.attach("worker", Recorder::shared("worker", &log, false));

        manager.start().await.unwrap();
        assert_eq!(manager.state(), LifecycleState::Ready);
        manager.shutdown().await.unwrap();
        assert_eq!(manager.state(), LifecycleState::Shutdown);

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "relay:init",
                "worker:init",
                "relay:start",
                "worker:start",
                "worker:stop",
                "relay:stop",
            ]
        );
    }

    #[tokio::test]
    async fn failed_start_rolls_back_started_components() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let mut manager = LifecycleManager::new().await.unwrap();
        manager.attach("relay", Recorder::shared("relay", &log, false));
        manager.attach("bridge", Recorder::shared("bridge", &log, true));

        let err = manager.start().await.unwrap_err();
        assert!(format!("{:#}", err).contains("bridge failed to start"));
        assert_eq!(manager.state(), LifecycleState::Shutdown);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["relay:init", "bridge:init", "relay:start", "relay:stop"]
        );

        // Nothing left to stop.
        manager.shutdown().await.unwrap();
        assert_eq!(log.lock().unwrap().len(), 4);
    }
}
