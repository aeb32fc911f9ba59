use anyhow::Result;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::ServerArgs;
use crate::core::auth::{DeviceAuth, qr_payload};
use crate::core::config::VoicepilotConfig;
use crate::core::lifecycle::LifecycleManager;
use crate::core::state::StateStore;
use crate::core::terminal::{self, GuideSection};
use crate::interfaces::relay::RelayServer;
use crate::interfaces::relay::hub::{HubSettings, RelayHub};
use crate::logging;
use crate::platform::{NativePlatform, Platform};

const PRUNE_EVERY: Duration = Duration::from_secs(60);
const CALL_SWEEP_EVERY: Duration = Duration::from_secs(5);

/// Print the pairing code when it differs from the last one shown.
async fn announce_pairing(
    auth: &DeviceAuth,
    config: &VoicepilotConfig,
    last_code: &StdMutex<Option<String>>,
) -> Result<()> {
    let Some(record) = auth.ensure_pairing().await? else {
        return Ok(());
    };
    {
        let mut last = last_code.lock().unwrap_or_else(|p| p.into_inner());
        if last.as_deref() == Some(record.pairing_code.as_str()) {
            return Ok(());
        }
        *last = Some(record.pairing_code.clone());
    }
    let status = auth.status().await?;
    let url = config.server.advertised_url();
    terminal::print_pairing_code(&record.pairing_code, &status.fingerprint_display);
    terminal::print_link(
        "QR payload",
        &qr_payload(&url, &record.pairing_code, &status.server_fingerprint),
    );
    Ok(())
}

pub async fn run(data_dir: &Path, args: ServerArgs) -> Result<()> {
    let mut config = VoicepilotConfig::load(data_dir).await?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    tokio::fs::create_dir_all(data_dir).await?;
    NativePlatform::restrict_dir_permissions(data_dir);
    logging::init("server", Some(data_dir.join("run").as_path()), false);

    let config = Arc::new(config);
    let store = Arc::new(StateStore::open(data_dir.join("state.json")).await?);
    let auth = Arc::new(DeviceAuth::new(store.clone(), config.server.clone()));
    let hub = RelayHub::new(HubSettings::from(&config.server));
    let last_code = Arc::new(StdMutex::new(None::<String>));

    let mut lifecycle = LifecycleManager::new().await?;
    lifecycle.attach(
        "relay",
        Arc::new(Mutex::new(RelayServer::new(
            auth.clone(),
            hub.clone(),
            config.clone(),
        ))),
    );

    {
        let (store, auth, config, last_code) =
            (store.clone(), auth.clone(), config.clone(), last_code.clone());
        lifecycle
            .every(PRUNE_EVERY, move || {
                let (store, auth, config, last_code) =
                    (store.clone(), auth.clone(), config.clone(), last_code.clone());
                async move {
                    if let Err(e) = store.prune().await {
                        warn!("State prune failed: {}", e);
                    }
                    if let Err(e) = announce_pairing(&auth, &config, &last_code).await {
                        warn!("Pairing refresh failed: {}", e);
                    }
                }
            })
            .await?;
    }
    {
        let hub = hub.clone();
        lifecycle
            .every(CALL_SWEEP_EVERY, move || {
                let hub = hub.clone();
                async move {
                    if hub.expire_calls().await {
                        debug!("Active call expired");
                    }
                }
            })
            .await?;
    }

    terminal::print_banner();
    lifecycle.start().await?;

    let status = auth.status().await?;
    GuideSection::new("Relay Server")
        .status("Listening", &format!("{}:{}", config.server.host, config.server.port))
        .status("Public URL", &config.server.advertised_url())
        .status("Fingerprint", &status.fingerprint_display)
        .status(
            "Paired device",
            status.device_id.as_deref().unwrap_or("none yet"),
        )
        .status("State", &store.path().display().to_string())
        .blank()
        .text("Press Ctrl+C to stop the server.")
        .print();
    if config.realtime.api_key().is_none() {
        terminal::print_warn("OPENAI_API_KEY is not set; voice sessions will be refused.");
    }
    announce_pairing(&auth, &config, &last_code).await?;
    info!("Relay server ready");

    tokio::signal::ctrl_c().await?;
    lifecycle.shutdown().await?;
    terminal::print_goodbye();
    Ok(())
}
