//! Chunked file uploads pushed by the client through the relay.

use anyhow::{Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::core::protocol::{FileUploadChunk, FileUploadStart};

const MAX_CHUNKS: u32 = 10_000;

struct PendingUpload {
    name: String,
    total_chunks: u32,
    request_id: Option<String>,
    chunks: HashMap<u32, Vec<u8>>,
    last_activity: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletedUpload {
    pub file_id: String,
    pub path: PathBuf,
    pub size: usize,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StalledUpload {
    pub file_id: String,
    pub request_id: Option<String>,
}

pub struct UploadManager {
    dir: PathBuf,
    timeout: Duration,
    pending: Mutex<HashMap<String, PendingUpload>>,
}

/// Keep only the final path component so a client cannot write outside the
/// uploads directory.
fn safe_name(name: &str) -> Option<String> {
    let base = Path::new(name.trim()).file_name()?.to_str()?.trim();
    if base.is_empty() || base == "." || base == ".." {
        return None;
    }
    Some(base.to_string())
}

impl UploadManager {
    pub fn new(workdir: &Path, timeout: Duration) -> Self {
        Self {
            dir: workdir.join(".voicepilot").join("uploads"),
            timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn start(&self, start: FileUploadStart) -> Result<()> {
        let Some(name) = safe_name(&start.name) else {
            bail!("invalid file name '{}'", start.name);
        };
        if start.total_chunks == 0 || start.total_chunks > MAX_CHUNKS {
            bail!("invalid chunk count {}", start.total_chunks);
        }
        info!(file_id = %start.file_id, name = %name, chunks = start.total_chunks, "Upload started");
        self.pending.lock().await.insert(
            start.file_id,
            PendingUpload {
                name,
                total_chunks: start.total_chunks,
                request_id: start.request_id,
                chunks: HashMap::new(),
                last_activity: Instant::now(),
            },
        );
        Ok(())
    }

    /// Store one chunk; writes the file once every chunk has arrived.
    pub async fn chunk(&self, chunk: FileUploadChunk) -> Result<Option<CompletedUpload>> {
        let bytes = STANDARD.decode(chunk.data.as_bytes())?;
        let finished = {
            let mut pending = self.pending.lock().await;
            let Some(upload) = pending.get_mut(&chunk.file_id) else {
                bail!("unknown upload '{}'", chunk.file_id);
            };
            if chunk.index >= upload.total_chunks {
                bail!(
                    "chunk {} out of range for upload '{}'",
                    chunk.index,
                    chunk.file_id
                );
            }
            upload.chunks.insert(chunk.index, bytes);
            upload.last_activity = Instant::now();
            if upload.chunks.len() < upload.total_chunks as usize {
                return Ok(None);
            }
            pending.remove(&chunk.file_id)
        };
        let Some(upload) = finished else {
            return Ok(None);
        };

        let mut data = Vec::new();
        for index in 0..upload.total_chunks {
            if let Some(part) = upload.chunks.get(&index) {
                data.extend_from_slice(part);
            }
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(&upload.name);
        tokio::fs::write(&path, &data).await?;
        info!(file_id = %chunk.file_id, path = %path.display(), size = data.len(), "Upload finished");

        Ok(Some(CompletedUpload {
            file_id: chunk.file_id,
            path,
            size: data.len(),
            request_id: upload.request_id,
        }))
    }

    /// Drop uploads that have not seen a chunk within the timeout.
    pub async fn reap(&self) -> Vec<StalledUpload> {
        let mut pending = self.pending.lock().await;
        let timeout = self.timeout;
        let stalled: Vec<String> = pending
            .iter()
            .filter(|(_, u)| u.last_activity.elapsed() > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        stalled
            .into_iter()
            .filter_map(|file_id| {
                let upload = pending.remove(&file_id)?;
                warn!(file_id = %file_id, received = upload.chunks.len(), "Upload stalled, discarding");
                Some(StalledUpload {
                    file_id,
                    request_id: upload.request_id,
                })
            })
            .collect()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
