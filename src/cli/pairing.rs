use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use crate::core::auth::{DeviceAuth, qr_payload};
use crate::core::config::VoicepilotConfig;
use crate::core::state::{StateStore, now_ms};
use crate::core::terminal::{self, GuideSection};

async fn open_auth(data_dir: &Path) -> Result<(VoicepilotConfig, DeviceAuth)> {
    let config = VoicepilotConfig::load(data_dir).await?;
    let store = Arc::new(StateStore::open(data_dir.join("state.json")).await?);
    let auth = DeviceAuth::new(store, config.server.clone());
    Ok((config, auth))
}

/// Read-only view of the pairing state; the running server owns the code.
pub async fn show(data_dir: &Path) -> Result<()> {
    let (config, auth) = open_auth(data_dir).await?;
    let status = auth.status().await?;
    let pairing = auth.store().read(|s| s.pairing.clone()).await;

    GuideSection::new("Pairing")
        .status("Server fingerprint", &status.fingerprint_display)
        .status(
            "Paired device",
            status.device_id.as_deref().unwrap_or("none"),
        )
        .print();

    if status.paired {
        println!();
        return Ok(());
    }
    match pairing {
        Some(record) if record.expires_at > now_ms() => {
            terminal::print_pairing_code(&record.pairing_code, &status.fingerprint_display);
            terminal::print_link(
                "QR payload",
                &qr_payload(
                    &config.server.advertised_url(),
                    &record.pairing_code,
                    &status.server_fingerprint,
                ),
            );
        }
        _ => terminal::print_info(
            "No live pairing code. Start `voicepilot server` to generate one.",
        ),
    }
    Ok(())
}

pub async fn unpair(data_dir: &Path) -> Result<()> {
    let (_, auth) = open_auth(data_dir).await?;
    if auth.unpair().await? {
        terminal::print_success("Device unpaired. Restart the server to pair a new one.");
    } else {
        terminal::print_info("No device was paired.");
    }
    Ok(())
}
