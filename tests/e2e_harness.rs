#![allow(dead_code)]

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use ed25519_dalek::{Signer, SigningKey};
use serde_json::{Value, json};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// A `voicepilot server` child process with its own data dir and port.
pub struct ServerHarness {
    child: Child,
    pub port: u16,
    pub base: String,
    data_dir: LocalTempDir,
    trace_log: Arc<Mutex<Vec<String>>>,
}

impl ServerHarness {
    pub async fn spawn() -> TestResult<Self> {
        let port = find_free_port()?;
        let data_dir = LocalTempDir::new("voicepilot-e2e-data")?;
        std::fs::write(
            data_dir.path().join("config.toml"),
            format!(
                "[server]\nhost = \"127.0.0.1\"\nport = {}\n\n[worker]\nserver_url = \"http://127.0.0.1:{}\"\n",
                port, port
            ),
        )?;
        let log_file = std::fs::File::create(data_dir.path().join("server.out"))?;
        let log_file_err = log_file.try_clone()?;

        let child = Command::new(voicepilot_binary_path()?)
            .arg("server")
            .env("VOICEPILOT_DATA_DIR", data_dir.path())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_file_err))
            .spawn()?;

        let mut harness = Self {
            child,
            port,
            base: format!("http://127.0.0.1:{}", port),
            data_dir,
            trace_log: Arc::new(Mutex::new(Vec::new())),
        };
        harness.wait_until_ready().await?;
        Ok(harness)
    }

    pub fn data_dir(&self) -> &Path {
        self.data_dir.path()
    }

    pub fn ws_base(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port)
    }

    async fn wait_until_ready(&mut self) -> TestResult<()> {
        for _ in 0..80 {
            if let Some(status) = self.child.try_wait()? {
                return Err(format!("voicepilot server exited early with status: {}", status).into());
            }

            let res = reqwest::Client::new()
                .get(format!("{}/health", self.base))
                .timeout(Duration::from_millis(700))
                .send()
                .await;
            if let Ok(resp) = res
                && resp.status().is_success()
            {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        Err("Timed out waiting for relay readiness".into())
    }

    /// The live pairing code, read from the server's state file.
    pub async fn pairing_code(&self) -> TestResult<String> {
        let path = self.data_dir().join("state.json");
        for _ in 0..40 {
            if let Ok(raw) = std::fs::read_to_string(&path)
                && let Ok(state) = serde_json::from_str::<Value>(&raw)
                && let Some(code) = state["pairing"]["pairing_code"].as_str()
            {
                return Ok(code.to_string());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err("server never wrote a pairing code".into())
    }

    /// Run a one-shot CLI command against this server's data dir.
    pub fn run_cli(&self, args: &[&str]) -> TestResult<Output> {
        Ok(Command::new(voicepilot_binary_path()?)
            .args(args)
            .env("VOICEPILOT_DATA_DIR", self.data_dir())
            .output()?)
    }

    /// Send a request and return `(status, json body)`.
    pub async fn request_json(
        &self,
        method: reqwest::Method,
        path: &str,
        bearer: Option<&str>,
        body: Option<Value>,
    ) -> TestResult<(u16, Value)> {
        let url = format!("{}{}", self.base, path);
        let mut req = reqwest::Client::new()
            .request(method.clone(), &url)
            .timeout(Duration::from_secs(10));
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }
        if let Some(payload) = body.clone() {
            req = req.json(&payload);
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let text = resp.text().await?;
        let parsed = serde_json::from_str::<Value>(&text).unwrap_or_else(|_| json!({ "raw": text }));

        let mut traces = self.trace_log.lock().unwrap_or_else(|e| e.into_inner());
        traces.push(format!(
            "REQUEST {} {}\nBODY {}\nSTATUS {}\nRESPONSE {}",
            method,
            path,
            body.unwrap_or(Value::Null),
            status,
            parsed
        ));
        drop(traces);

        Ok((status, parsed))
    }

    fn persist_trace_file(&self) -> TestResult<PathBuf> {
        let path = std::env::temp_dir().join(format!("voicepilot-e2e-{}.trace.log", self.port));
        let lines = self.trace_log.lock().unwrap_or_else(|e| e.into_inner());
        std::fs::write(&path, lines.join("\n\n---\n\n"))?;
        Ok(path)
    }
}

impl Drop for ServerHarness {
    fn drop(&mut self) {
        if std::thread::panicking() {
            let _ = self.persist_trace_file();
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Ed25519 key standing in for the phone.
pub struct Phone {
    key: SigningKey,
    pub device_id: Option<String>,
}

impl Phone {
    pub fn new() -> Self {
        Self {
            key: SigningKey::from_bytes(&rand::random::<[u8; 32]>()),
            device_id: None,
        }
    }

    pub fn public_b64(&self) -> String {
        B64.encode(self.key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &str) -> String {
        B64.encode(self.key.sign(message.as_bytes()).to_bytes())
    }

    /// Body for a device-signed POST to `path`.
    pub fn signed(&self, path: &str) -> Value {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let nonce = Uuid::new_v4().simple().to_string();
        let message = format!("POST\n{}\n{}\n{}", path, timestamp, nonce);
        json!({
            "device_id": self.device_id.clone().unwrap_or_default(),
            "timestamp": timestamp,
            "nonce": nonce,
            "signature": self.sign(&message),
        })
    }

    /// Claim with the displayed code, then confirm with our key.
    pub async fn pair(&mut self, server: &ServerHarness) -> TestResult<Value> {
        let code = server.pairing_code().await?;
        let (status, claim) = server
            .request_json(
                reqwest::Method::POST,
                "/pairing/claim",
                None,
                Some(json!({ "code": code })),
            )
            .await?;
        if status != 200 {
            return Err(format!("claim failed: {} {}", status, claim).into());
        }
        let nonce = claim["pairing_nonce"].as_str().unwrap_or_default();
        let fingerprint = claim["server_fingerprint"].as_str().unwrap_or_default();
        let (status, confirm) = server
            .request_json(
                reqwest::Method::POST,
                "/pairing/confirm",
                None,
                Some(json!({
                    "pairing_nonce": nonce,
                    "device_public_key": self.public_b64(),
                    "signature": self.sign(&format!("pairing:{}:{}", nonce, fingerprint)),
                })),
            )
            .await?;
        if status != 200 {
            return Err(format!("confirm failed: {} {}", status, confirm).into());
        }
        self.device_id = confirm["device_id"].as_str().map(str::to_string);
        Ok(confirm)
    }
}

pub fn find_free_port() -> TestResult<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

fn voicepilot_binary_path() -> TestResult<PathBuf> {
    if let Some(path) = option_env!("CARGO_BIN_EXE_voicepilot") {
        return Ok(PathBuf::from(path));
    }

    let candidate = PathBuf::from("target")
        .join("debug")
        .join(if cfg!(windows) { "voicepilot.exe" } else { "voicepilot" });
    if candidate.exists() {
        return Ok(candidate);
    }

    Err("Could not locate voicepilot test binary path".into())
}

struct LocalTempDir {
    path: PathBuf,
}

impl LocalTempDir {
    fn new(prefix: &str) -> TestResult<Self> {
        let path = std::env::temp_dir().join(format!("{}-{}", prefix, Uuid::new_v4().simple()));
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LocalTempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}
