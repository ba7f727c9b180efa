use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::config::ArchiveConfig;
use crate::error::{ClassroomError, Result};
use crate::model::{MaterialRef, RoomSession, Stroke};

const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Final state of a room handed to the persistence sink at `ended`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionArchive {
    pub session: RoomSession,
    #[serde(default)]
    pub strokes: Vec<Stroke>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub material: Option<MaterialRef>,
}

#[async_trait]
pub trait ArchiveSink: Send + Sync {
    async fn store(&self, archive: &SessionArchive) -> Result<()>;
}

/// `POST {base_url}/rooms/{room_id}/archive` with the archive as JSON.
pub struct HttpArchiveSink {
    base_url: String,
    client: reqwest::Client,
}

impl HttpArchiveSink {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClassroomError::Archive(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl ArchiveSink for HttpArchiveSink {
    async fn store(&self, archive: &SessionArchive) -> Result<()> {
        let url = format!(
            "{}/rooms/{}/archive",
            self.base_url,
            urlencoding::encode(&archive.session.room_id)
        );
        let response = self
            .client
            .post(&url)
            .json(archive)
            .send()
            .await
            .map_err(|e| ClassroomError::Archive(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ClassroomError::Archive(format!(
                "Archive rejected with status {}: {}",
                status, error_text
            )));
        }
        Ok(())
    }
}

/// Writes `{dir}/{room_id}.json`, replacing any earlier archive of the room.
pub struct FileArchiveSink {
    dir: PathBuf,
}

impl FileArchiveSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, room_id: &str) -> PathBuf {
        let name: String = room_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

#[async_trait]
impl ArchiveSink for FileArchiveSink {
    async fn store(&self, archive: &SessionArchive) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let body = serde_json::to_vec_pretty(archive)?;
        tokio::fs::write(self.path_for(&archive.session.room_id), body).await?;
        Ok(())
    }
}

/// HTTP sink when a URL is configured, file sink otherwise.
pub fn sink_from_config(config: &ArchiveConfig) -> Result<Arc<dyn ArchiveSink>> {
    match &config.url {
        Some(url) => Ok(Arc::new(HttpArchiveSink::new(url.clone(), config.timeout)?)),
        None => Ok(Arc::new(FileArchiveSink::new(config.dir.clone()))),
    }
}

/// Best-effort background hand-off.
///
/// `submit` never blocks the caller; the worker retries a failed store a
/// bounded number of times, then logs and drops the archive.
pub struct ArchiveQueue {
    sender: mpsc::UnboundedSender<SessionArchive>,
    worker: JoinHandle<()>,
}

impl ArchiveQueue {
    pub fn new(sink: Arc<dyn ArchiveSink>, retry_count: u32) -> Self {
        Self::with_retry_delay(sink, retry_count, RETRY_DELAY)
    }

    pub fn with_retry_delay(sink: Arc<dyn ArchiveSink>, retry_count: u32, retry_delay: Duration) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(Self::process(sink, receiver, retry_count, retry_delay));
        Self { sender, worker }
    }

    pub fn submit(&self, archive: SessionArchive) {
        tracing::info!(
            room_id = %archive.session.room_id,
            strokes = archive.strokes.len(),
            "Queueing session archive"
        );
        if let Err(e) = self.sender.send(archive) {
            tracing::error!(error = %e, "Failed to queue session archive");
        }
    }

    /// Waits for everything already submitted to be stored or given up on.
    pub async fn shutdown(self) {
        drop(self.sender);
        if let Err(e) = self.worker.await {
            tracing::error!(error = %e, "Archive worker panicked");
        }
    }

    async fn process(
        sink: Arc<dyn ArchiveSink>,
        mut receiver: mpsc::UnboundedReceiver<SessionArchive>,
        retry_count: u32,
        retry_delay: Duration,
    ) {
        tracing::debug!(retry_count, "Archive worker started");

        while let Some(archive) = receiver.recv().await {
            let room_id = archive.session.room_id.clone();
            let mut attempt = 0;
            loop {
                match sink.store(&archive).await {
                    Ok(()) => {
                        tracing::info!(room_id = %room_id, attempt, "Session archived");
                        break;
                    }
                    Err(e) if attempt < retry_count => {
                        attempt += 1;
                        tracing::warn!(room_id = %room_id, attempt, error = %e, "Archive failed, retrying");
                        sleep(retry_delay).await;
                    }
                    Err(e) => {
                        tracing::error!(room_id = %room_id, error = %e, "Giving up on session archive");
                        break;
                    }
                }
            }
        }

        tracing::debug!("Archive worker stopped");
    }
}
