use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct VoicepilotConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub realtime: RealtimeConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub sideband: SidebandConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Externally reachable URL advertised in the pairing QR payload.
    pub public_url: Option<String>,
    pub pairing_ttl_secs: u64,
    pub session_ttl_secs: u64,
    pub join_token_ttl_secs: u64,
    pub nonce_window_secs: u64,
    pub timestamp_skew_secs: u64,
    pub event_buffer_size: usize,
    pub client_session_ttl_secs: u64,
    pub call_ttl_secs: u64,
    pub call_redispatch_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8787,
            public_url: None,
            pairing_ttl_secs: 600,
            session_ttl_secs: 3600,
            join_token_ttl_secs: 600,
            nonce_window_secs: 600,
            timestamp_skew_secs: 300,
            event_buffer_size: 500,
            client_session_ttl_secs: 300,
            call_ttl_secs: 45,
            call_redispatch_secs: 10,
        }
    }
}

impl ServerConfig {
    pub fn advertised_url(&self) -> String {
        match &self.public_url {
            Some(url) if !url.trim().is_empty() => url.trim_end_matches('/').to_string(),
            _ => {
                let host = if self.host == "0.0.0.0" {
                    "127.0.0.1"
                } else {
                    self.host.as_str()
                };
                format!("http://{}:{}", host, self.port)
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub api_base: String,
    pub ws_url: String,
    pub model: String,
    pub voice: String,
    pub voices: Vec<String>,
    pub instructions: Option<String>,
}

fn default_voices() -> Vec<String> {
    [
        "alloy", "ash", "ballad", "cedar", "coral", "echo", "marin", "sage", "shimmer", "verse",
    ]
    .iter()
    .map(|v| v.to_string())
    .collect()
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            ws_url: "wss://api.openai.com/v1/realtime".to_string(),
            model: "gpt-realtime".to_string(),
            voice: "marin".to_string(),
            voices: default_voices(),
            instructions: None,
        }
    }
}

impl RealtimeConfig {
    /// API key is read from the environment only, never from disk.
    pub fn api_key(&self) -> Option<String> {
        std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
    }

    pub fn is_allowed_voice(&self, voice: &str) -> bool {
        self.voices.iter().any(|v| v == voice)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub server_url: String,
    pub agent: String,
    pub max_workers: usize,
    pub idle_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub bridge_port: u16,
    pub request_timeout_secs: u64,
    pub reconnect_delay_secs: u64,
    pub heartbeat_secs: u64,
    pub upload_timeout_secs: u64,
    pub workdir: Option<PathBuf>,
    pub task_history: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8787".to_string(),
            agent: "claude".to_string(),
            max_workers: 3,
            idle_timeout_secs: 60,
            poll_interval_ms: 250,
            bridge_port: 8799,
            request_timeout_secs: 300,
            reconnect_delay_secs: 3,
            heartbeat_secs: 15,
            upload_timeout_secs: 120,
            workdir: None,
            task_history: 20,
        }
    }
}

impl WorkerConfig {
    pub fn resolved_workdir(&self) -> PathBuf {
        self.workdir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SidebandConfig {
    pub max_attempts: usize,
    pub backoff_ms: Vec<u64>,
    pub dedup_window_ms: u64,
    pub progress_min_interval_ms: u64,
    pub progress_dup_window_ms: u64,
    pub notice_cooldown_secs: u64,
}

impl Default for SidebandConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff_ms: vec![500, 1000, 2000, 4000],
            dedup_window_ms: 5000,
            progress_min_interval_ms: 750,
            progress_dup_window_ms: 2000,
            notice_cooldown_secs: 30,
        }
    }
}

impl VoicepilotConfig {
    pub async fn load<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let config_path = data_dir.as_ref().join("config.toml");
        if !config_path.exists() {
            info!("No config.toml found, using defaults.");
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(&config_path).await?;
        let config = Self::parse(&content)?;
        info!(
            "Loaded config: server={}:{}, agent={}, max_workers={}",
            config.server.host, config.server.port, config.worker.agent, config.worker.max_workers
        );
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: VoicepilotConfig = toml::from_str(content)?;

        if config.worker.max_workers == 0 {
            config.worker.max_workers = 1;
        }
        if config.server.event_buffer_size == 0 {
            config.server.event_buffer_size = 1;
        }
        if config.sideband.max_attempts == 0 {
            config.sideband.max_attempts = 1;
        }
        Ok(config)
    }
}
