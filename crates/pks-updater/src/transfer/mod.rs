//! Resumable artifact downloads.
//!
//! [`TransferManager`] downloads files with progress reporting, resume support
//! via HTTP Range headers, retry with a fixed delay, and cooperative
//! cancellation. It also verifies checksums, extracts archives and prunes the
//! staging directory.
//!
//! Each download is tracked under its own id. Every download ends with exactly
//! one terminal event: [`TransferEvent::Complete`], [`TransferEvent::Error`] or
//! [`TransferEvent::Cancelled`].

pub mod archive;
pub mod progress;
pub mod verify;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::header::RANGE;
use reqwest::StatusCode;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::TransferConfig;
use crate::error::UpdateError;
use crate::registry::USER_AGENT;

pub use progress::DownloadProgress;
pub use verify::HashAlgorithm;

use progress::{eta_seconds, percentage, ProgressThrottle, SpeedWindow};

/// Default age after which staged files are pruned.
pub const DEFAULT_CLEANUP_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Capacity of the transfer event channel.
const EVENT_CAPACITY: usize = 256;

/// Lifecycle of a tracked download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Cancelled,
    Error,
}

impl DownloadStatus {
    /// Whether the transfer loop must stop.
    fn halts(self) -> bool {
        matches!(self, Self::Paused | Self::Cancelled)
    }
}

/// In-memory record of one download.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRecord {
    pub id: String,
    pub url: String,
    pub destination: PathBuf,
    /// Bytes already on disk when the current attempt started
    pub start_byte: u64,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub progress: f64,
    pub speed: f64,
    pub eta: Option<f64>,
    pub status: DownloadStatus,
    pub started_at: DateTime<Utc>,
    pub last_progress_at: DateTime<Utc>,
}

/// Notifications published by the transfer manager.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    Progress(DownloadProgress),
    Complete { id: String, path: PathBuf },
    Paused { id: String },
    Cancelled { id: String },
    Error { id: String, error: String },
}

impl TransferEvent {
    /// Id of the download the event belongs to.
    pub fn id(&self) -> &str {
        match self {
            Self::Progress(p) => &p.id,
            Self::Complete { id, .. }
            | Self::Paused { id }
            | Self::Cancelled { id }
            | Self::Error { id, .. } => id,
        }
    }

    /// Whether no further events follow for this id.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress(_))
    }
}

/// Per-download options.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Attempts including the first
    pub retries: u32,
    /// Fixed pause between attempts
    pub retry_delay: Duration,
    /// Continue a partial destination file with a range request
    pub resume_support: bool,
    /// Minimum spacing between progress events
    pub progress_interval: Duration,
    /// Write buffer size
    pub chunk_size: usize,
    /// Extra request headers
    pub headers: Vec<(String, String)>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self::from(&TransferConfig::default())
    }
}

impl From<&TransferConfig> for DownloadOptions {
    fn from(config: &TransferConfig) -> Self {
        Self {
            retries: config.retries.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            resume_support: config.resume_support,
            progress_interval: Duration::from_millis(config.progress_interval_ms),
            chunk_size: config.chunk_size.max(8192),
            headers: Vec::new(),
        }
    }
}

/// Resumable downloader with progress events.
pub struct TransferManager {
    client: reqwest::Client,
    defaults: DownloadOptions,
    active: Arc<Mutex<HashMap<String, DownloadRecord>>>,
    events: broadcast::Sender<TransferEvent>,
}

impl TransferManager {
    /// Create a manager from transfer settings.
    pub fn new(config: &TransferConfig) -> Result<Self, UpdateError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| UpdateError::ConfigError(format!("failed to build HTTP client: {}", e)))?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            client,
            defaults: DownloadOptions::from(config),
            active: Arc::new(Mutex::new(HashMap::new())),
            events,
        })
    }

    /// Options derived from the manager's settings.
    pub fn default_options(&self) -> DownloadOptions {
        self.defaults.clone()
    }

    /// Subscribe to transfer events.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    /// Generate a fresh download id.
    pub fn allocate_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Snapshot of in-flight downloads.
    pub fn active_downloads(&self) -> Vec<DownloadRecord> {
        self.active
            .lock()
            .map(|active| active.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Download `url` to `destination` under a generated id.
    pub async fn download_file(
        &self,
        url: &str,
        destination: &Path,
        options: &DownloadOptions,
    ) -> Result<PathBuf, UpdateError> {
        let id = Self::allocate_id();
        self.download_file_as(&id, url, destination, options).await
    }

    /// Download `url` to `destination` under a caller-chosen id.
    ///
    /// # Arguments
    ///
    /// * `id` - Identifier used in events and for cancellation
    /// * `url` - Source URL
    /// * `destination` - Target file; parent directories are created
    /// * `options` - Retry, resume and progress settings
    ///
    /// # Returns
    ///
    /// The destination path once the file is complete.
    ///
    /// # Errors
    ///
    /// - `Cancelled` if [`TransferManager::cancel_download`] or
    ///   [`TransferManager::pause_download`] was called for `id`
    /// - `DownloadFailed` carrying the last error once every attempt failed
    pub async fn download_file_as(
        &self,
        id: &str,
        url: &str,
        destination: &Path,
        options: &DownloadOptions,
    ) -> Result<PathBuf, UpdateError> {
        info!("Starting download {}: {} -> {:?}", id, url, destination);

        let now = Utc::now();
        self.with_active(|active| {
            active.insert(
                id.to_string(),
                DownloadRecord {
                    id: id.to_string(),
                    url: url.to_string(),
                    destination: destination.to_path_buf(),
                    start_byte: 0,
                    total_bytes: 0,
                    downloaded_bytes: 0,
                    progress: 0.0,
                    speed: 0.0,
                    eta: None,
                    status: DownloadStatus::Pending,
                    started_at: now,
                    last_progress_at: now,
                },
            );
        });

        if let Some(parent) = destination.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return Err(self.fail(id, 0, e.into()));
            }
        }

        let attempts = options.retries.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            if self.halted(id) {
                return Err(UpdateError::Cancelled);
            }

            match self.attempt(id, url, destination, options).await {
                Ok(size) => {
                    self.with_active(|active| active.remove(id));
                    info!("Download {} complete: {} bytes", id, size);
                    let _ = self.events.send(TransferEvent::Complete {
                        id: id.to_string(),
                        path: destination.to_path_buf(),
                    });
                    return Ok(destination.to_path_buf());
                }
                Err(UpdateError::Cancelled) => {
                    debug!("Download {} stopped", id);
                    return Err(UpdateError::Cancelled);
                }
                Err(e) => {
                    warn!(
                        "Download {} attempt {}/{} failed: {}",
                        id, attempt, attempts, e
                    );
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(options.retry_delay).await;
                    }
                }
            }
        }

        let last_error =
            last_error.unwrap_or_else(|| UpdateError::Network("no attempt made".to_string()));
        Err(self.fail(id, attempts, last_error))
    }

    /// One request/stream cycle. Returns the final file size.
    async fn attempt(
        &self,
        id: &str,
        url: &str,
        destination: &Path,
        options: &DownloadOptions,
    ) -> Result<u64, UpdateError> {
        let existing = match tokio::fs::metadata(destination).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => 0,
        };
        let start_byte = if options.resume_support { existing } else { 0 };

        let mut request = self.client.get(url);
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if start_byte > 0 {
            debug!("Resuming download {} from byte {}", id, start_byte);
            request = request.header(RANGE, format!("bytes={}-", start_byte));
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::RANGE_NOT_SATISFIABLE && start_byte > 0 {
            info!("Download {} already complete on disk", id);
            self.report_progress(id, start_byte, start_byte, start_byte, 0.0, true)?;
            return Ok(start_byte);
        }
        if !status.is_success() {
            return Err(match status {
                StatusCode::NOT_FOUND => UpdateError::NotFound(url.to_string()),
                StatusCode::UNAUTHORIZED => UpdateError::AuthFailed(url.to_string()),
                StatusCode::FORBIDDEN => UpdateError::RateLimited(url.to_string()),
                s => UpdateError::Network(format!("download failed with status {}", s.as_u16())),
            });
        }

        let resumed = start_byte > 0 && status == StatusCode::PARTIAL_CONTENT;
        if start_byte > 0 && !resumed {
            warn!("Server ignored range request, restarting download {}", id);
        }

        let file = if resumed {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(destination)
                .await?
        } else {
            tokio::fs::File::create(destination).await?
        };
        let mut writer = BufWriter::with_capacity(options.chunk_size, file);

        let offset = if resumed { start_byte } else { 0 };
        let total = response.content_length().map_or(0, |len| len + offset);
        let mut downloaded = offset;

        self.with_active(|active| {
            if let Some(record) = active.get_mut(id) {
                record.start_byte = offset;
                record.total_bytes = total;
                record.downloaded_bytes = downloaded;
                if !record.status.halts() {
                    record.status = DownloadStatus::Downloading;
                }
            }
        });

        let mut throttle = ProgressThrottle::new(options.progress_interval);
        let mut window = SpeedWindow::new();
        window.record(Instant::now(), downloaded);

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            if self.halted(id) {
                return Err(UpdateError::Cancelled);
            }
            let chunk = chunk.map_err(|e| UpdateError::Network(e.to_string()))?;
            writer.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            let now = Instant::now();
            window.record(now, downloaded);
            if throttle.should_emit(now, percentage(downloaded, total)) {
                self.report_progress(id, offset, downloaded, total, window.speed(), false)?;
            }
        }
        writer.flush().await?;
        writer.get_ref().sync_all().await?;

        let final_size = tokio::fs::metadata(destination).await?.len();
        if total > 0 && final_size != total {
            return Err(UpdateError::SizeMismatch {
                expected: total,
                actual: final_size,
            });
        }

        self.report_progress(id, offset, final_size, final_size.max(total), window.speed(), true)?;
        Ok(final_size)
    }

    /// Update the record and emit progress under the tracking lock.
    ///
    /// Fails with `Cancelled` instead of emitting once the download was halted.
    fn report_progress(
        &self,
        id: &str,
        start_byte: u64,
        downloaded: u64,
        total: u64,
        speed: f64,
        completed: bool,
    ) -> Result<(), UpdateError> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| UpdateError::InvalidState("transfer tracking poisoned".to_string()))?;
        let record = match active.get_mut(id) {
            Some(record) if !record.status.halts() => record,
            _ => return Err(UpdateError::Cancelled),
        };

        let progress = percentage(downloaded, total);
        let eta = if total > 0 {
            eta_seconds(total.saturating_sub(downloaded), speed)
        } else {
            None
        };

        record.start_byte = start_byte;
        record.downloaded_bytes = downloaded;
        record.total_bytes = total;
        record.progress = progress;
        record.speed = speed;
        record.eta = eta;
        record.last_progress_at = Utc::now();
        if completed {
            record.status = DownloadStatus::Completed;
        }

        let _ = self.events.send(TransferEvent::Progress(DownloadProgress {
            id: id.to_string(),
            progress,
            downloaded_bytes: downloaded,
            total_bytes: total,
            speed,
            eta,
        }));
        Ok(())
    }

    /// Mark a download failed, emit its error event and build the returned error.
    fn fail(&self, id: &str, attempts: u32, cause: UpdateError) -> UpdateError {
        self.with_active(|active| active.remove(id));
        error!("Download {} failed: {}", id, cause);
        let _ = self.events.send(TransferEvent::Error {
            id: id.to_string(),
            error: cause.to_string(),
        });
        UpdateError::DownloadFailed {
            attempts,
            reason: cause.to_string(),
        }
    }

    fn halted(&self, id: &str) -> bool {
        self.active
            .lock()
            .map(|active| active.get(id).map_or(true, |r| r.status.halts()))
            .unwrap_or(true)
    }

    fn with_active<R>(&self, f: impl FnOnce(&mut HashMap<String, DownloadRecord>) -> R) -> Option<R> {
        self.active.lock().ok().map(|mut active| f(&mut active))
    }

    /// Stop a download and delete its partial file.
    ///
    /// # Returns
    ///
    /// `false` if no download with `id` is active.
    pub async fn cancel_download(&self, id: &str) -> bool {
        let Some(record) = self.halt(id, DownloadStatus::Cancelled) else {
            return false;
        };

        match tokio::fs::remove_file(&record.destination).await {
            Ok(()) => debug!("Removed partial file {:?}", record.destination),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove {:?}: {}", record.destination, e),
        }

        info!("Download {} cancelled", id);
        let _ = self.events.send(TransferEvent::Cancelled { id: id.to_string() });
        true
    }

    /// Stop a download but keep its partial file for a later resume.
    pub fn pause_download(&self, id: &str) -> bool {
        if self.halt(id, DownloadStatus::Paused).is_none() {
            return false;
        }
        info!("Download {} paused", id);
        let _ = self.events.send(TransferEvent::Paused { id: id.to_string() });
        true
    }

    /// Cancel every active download. Returns how many were stopped.
    pub async fn cancel_all(&self) -> usize {
        let ids: Vec<String> = self.active_downloads().into_iter().map(|r| r.id).collect();
        let mut cancelled = 0;
        for id in ids {
            if self.cancel_download(&id).await {
                cancelled += 1;
            }
        }
        cancelled
    }

    fn halt(&self, id: &str, status: DownloadStatus) -> Option<DownloadRecord> {
        let mut active = self.active.lock().ok()?;
        let record = active.get_mut(id)?;
        // A finished download only waits for its `Complete` event.
        if record.status.halts() || matches!(record.status, DownloadStatus::Completed) {
            return None;
        }
        record.status = status;
        let record = record.clone();
        active.remove(id);
        Some(record)
    }

    /// Check a file against an expected hex digest. IO failures yield `false`.
    pub async fn verify_download(
        &self,
        path: &Path,
        expected_hash: &str,
        algorithm: HashAlgorithm,
    ) -> bool {
        verify::verify_file(path, expected_hash, algorithm).await
    }

    /// Extract a zip archive into `destination_dir`.
    ///
    /// # Errors
    ///
    /// Returns `PathTraversal` if any entry resolves outside `destination_dir`.
    pub async fn extract_archive(
        &self,
        archive_path: &Path,
        destination_dir: &Path,
    ) -> Result<Vec<PathBuf>, UpdateError> {
        let archive_path = archive_path.to_path_buf();
        let destination_dir = destination_dir.to_path_buf();
        tokio::task::spawn_blocking(move || archive::extract_zip(&archive_path, &destination_dir))
            .await?
    }

    /// Delete files under `dir` last modified more than `max_age` ago.
    ///
    /// # Returns
    ///
    /// Number of files removed. A missing directory removes nothing.
    pub async fn cleanup_downloads(&self, dir: &Path, max_age: Duration) -> Result<usize, UpdateError> {
        let dir = dir.to_path_buf();
        let removed = tokio::task::spawn_blocking(move || {
            let cutoff = SystemTime::now()
                .checked_sub(max_age)
                .unwrap_or(SystemTime::UNIX_EPOCH);
            prune_older_than(&dir, cutoff)
        })
        .await??;

        if removed > 0 {
            info!("Removed {} stale download file(s)", removed);
        }
        Ok(removed)
    }
}

fn prune_older_than(dir: &Path, cutoff: SystemTime) -> Result<usize, UpdateError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;

        if meta.is_dir() {
            removed += prune_older_than(&path, cutoff)?;
            continue;
        }
        let modified = meta.modified().unwrap_or_else(|_| SystemTime::now());
        if modified < cutoff {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    debug!("Removed stale file {:?}", path);
                    removed += 1;
                }
                Err(e) => warn!("Could not remove {:?}: {}", path, e),
            }
        }
    }
    Ok(removed)
}
