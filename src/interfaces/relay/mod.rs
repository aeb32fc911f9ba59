//! The relay server: pairing and device routes, the worker socket and the
//! client event sockets, all on one axum listener.

pub(crate) mod auth;
pub mod error;
mod handlers;
pub mod hub;
mod realtime;
mod router;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::core::auth::DeviceAuth;
use crate::core::config::VoicepilotConfig;
use crate::core::lifecycle::LifecycleComponent;
use hub::RelayHub;

pub use router::build_relay_router;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) auth: Arc<DeviceAuth>,
    pub(crate) hub: Arc<RelayHub>,
    pub(crate) config: Arc<VoicepilotConfig>,
    pub(crate) http: reqwest::Client,
}

pub struct RelayServer {
    state: AppState,
    shutdown: CancellationToken,
    serve_task: Option<JoinHandle<()>>,
}

impl RelayServer {
    pub fn new(auth: Arc<DeviceAuth>, hub: Arc<RelayHub>, config: Arc<VoicepilotConfig>) -> Self {
        Self {
            state: AppState {
                auth,
                hub,
                config,
                http: reqwest::Client::new(),
            },
            shutdown: CancellationToken::new(),
            serve_task: None,
        }
    }
}

#[async_trait]
impl LifecycleComponent for RelayServer {
    async fn on_init(&mut self) -> Result<()> {
        info!("Relay server initializing...");
        self.state.auth.ensure_identity().await?;
        self.state.auth.ensure_pairing().await?;
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let addr = format!(
            "{}:{}",
            self.state.config.server.host, self.state.config.server.port
        );
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let app = build_relay_router(self.state.clone());
        let shutdown = self.shutdown.clone();

        info!("Relay server listening on http://{addr}");
        self.serve_task = Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
            {
                error!("Relay server crashed: {}", e);
            }
        }));
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("Relay server shutting down...");
        self.shutdown.cancel();
        if let Some(task) = self.serve_task.take() {
            task.abort();
        }
        Ok(())
    }
}
