use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use super::WorkerArgs;
use crate::core::agent::plugin_for;
use crate::core::bridge::client::bridge_url;
use crate::core::config::VoicepilotConfig;
use crate::core::lifecycle::LifecycleManager;
use crate::core::terminal::{self, GuideSection};
use crate::interfaces::worker::WorkerRuntime;
use crate::logging;

const IDLE_SWEEP_EVERY: Duration = Duration::from_secs(15);
const UPLOAD_REAP_EVERY: Duration = Duration::from_secs(15);

pub async fn run(data_dir: &Path, args: WorkerArgs) -> Result<()> {
    let mut config = VoicepilotConfig::load(data_dir).await?;
    if let Some(server) = args.server {
        config.worker.server_url = server;
    }
    if let Some(agent) = args.agent {
        config.worker.agent = agent;
    }
    if let Some(workdir) = args.workdir {
        config.worker.workdir = Some(PathBuf::from(workdir));
    }
    let plugin = plugin_for(&config.worker.agent)?;

    tokio::fs::create_dir_all(data_dir).await?;
    logging::init("worker", Some(data_dir.join("run").as_path()), false);

    let config = Arc::new(config);
    let runtime = WorkerRuntime::new(
        config.clone(),
        data_dir.to_path_buf(),
        plugin,
        args.join_token,
    );
    let handle = runtime.handle();

    let mut lifecycle = LifecycleManager::new().await?;
    lifecycle.attach("worker", Arc::new(Mutex::new(runtime)));
    {
        let handle = handle.clone();
        lifecycle
            .every(IDLE_SWEEP_EVERY, move || {
                let handle = handle.clone();
                async move {
                    let stopped = handle.pool().cleanup_idle_workers().await;
                    if stopped > 0 {
                        debug!(stopped, "Idle agent processes stopped");
                    }
                }
            })
            .await?;
    }
    {
        let handle = handle.clone();
        lifecycle
            .every(UPLOAD_REAP_EVERY, move || {
                let handle = handle.clone();
                async move {
                    handle.reap_uploads().await;
                }
            })
            .await?;
    }

    terminal::print_banner();
    lifecycle.start().await?;

    GuideSection::new("Worker")
        .status("Server", &config.worker.server_url)
        .status("Agent", &config.worker.agent)
        .status(
            "Workdir",
            &config.worker.resolved_workdir().display().to_string(),
        )
        .status("Max agents", &config.worker.max_workers.to_string())
        .status("Local bridge", &bridge_url(config.worker.bridge_port))
        .blank()
        .text("Press Ctrl+C to stop the worker.")
        .print();

    tokio::signal::ctrl_c().await?;
    lifecycle.shutdown().await?;
    terminal::print_goodbye();
    Ok(())
}
