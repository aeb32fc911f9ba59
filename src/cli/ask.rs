//! `ask` and `request-file`: run by agent subprocesses, they block until the
//! user answers through the worker's local bridge and print the answer JSON.

use anyhow::{Context, Result, bail};
use std::path::Path;

use super::AskArgs;
use crate::core::bridge::client::send_request;
use crate::core::bridge::{BridgeRequest, Resolution};
use crate::core::config::VoicepilotConfig;

fn task_id(args: &AskArgs) -> Result<String> {
    args.task
        .clone()
        .or_else(|| std::env::var("VOICEPILOT_TASK_ID").ok())
        .filter(|t| !t.trim().is_empty())
        .context("--task is required outside an agent task")
}

async fn bridge_port(data_dir: &Path) -> Result<u16> {
    if let Some(port) = std::env::var("VOICEPILOT_BRIDGE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
    {
        return Ok(port);
    }
    Ok(VoicepilotConfig::load(data_dir).await?.worker.bridge_port)
}

fn request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn print_resolution(resolution: &Resolution) -> Result<()> {
    println!("{}", serde_json::to_string(resolution)?);
    Ok(())
}

pub async fn run_ask(data_dir: &Path, args: AskArgs) -> Result<()> {
    if args.question.trim().is_empty() {
        bail!("--question is required");
    }
    let request = BridgeRequest::InputRequest {
        id: request_id(),
        task_id: task_id(&args)?,
        question: args.question,
        options: args.options,
        timeout_secs: args.timeout_secs,
    };
    let resolution = send_request(bridge_port(data_dir).await?, request).await?;
    print_resolution(&resolution)
}

pub async fn run_request_file(data_dir: &Path, args: AskArgs) -> Result<()> {
    let request = BridgeRequest::FileRequest {
        id: request_id(),
        task_id: task_id(&args)?,
        prompt: args.prompt,
        timeout_secs: args.timeout_secs,
    };
    let resolution = send_request(bridge_port(data_dir).await?, request).await?;
    print_resolution(&resolution)
}
