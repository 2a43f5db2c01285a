//! Sending side of the chunk pull protocol.
//!
//! A download task registers its source file here when it is dispatched. The
//! beacon then fetches chunks by index, independently of the poll cycle. Only
//! one chunk is ever in memory: each request is a seek + read on the source.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime};

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::types::{DownloadProgress, DownloadMeta, TransferError, TransferSummary};
use crate::config::TransferConfig;
use crate::hasher;

/// What the download converter needs to build its dispatch payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registered {
    pub file_size: u64,
    pub file_hash: String,
    pub chunk_size: u32,
    pub total_chunks: u32,
}

/// Owns the table of in-flight downloads, keyed by task id.
pub struct TransferManager {
    transfers: RwLock<HashMap<String, Transfer>>,
    config: TransferConfig,
}

struct Transfer {
    meta: DownloadMeta,
    progress: DownloadProgress,
}

impl TransferManager {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            transfers: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Stat and hash `source`, then make it fetchable under `task_id`.
    ///
    /// Registering an id twice replaces the earlier entry.
    pub async fn register(
        &self,
        task_id: &str,
        source: &str,
        chunk_size: Option<u32>,
    ) -> Result<Registered, TransferError> {
        let chunk_size = chunk_size.unwrap_or(self.config.chunk_size);
        let (min, max) = (self.config.min_chunk_size.max(1), self.config.max_chunk_size);
        if !(min..=max).contains(&chunk_size) {
            return Err(TransferError::InvalidChunkSize {
                size: chunk_size,
                min,
                max,
            });
        }
        let path = validate_transfer_path(source)?;

        let metadata = tokio::fs::metadata(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => TransferError::FileNotFound(source.to_string()),
            _ => TransferError::Io(format!("{source}: {e}")),
        })?;
        if metadata.is_dir() {
            return Err(TransferError::InvalidPath(format!("{source} is a directory")));
        }

        let file_size = metadata.len();
        if file_size > self.config.max_file_size {
            return Err(TransferError::TooLarge {
                size: file_size,
                max: self.config.max_file_size,
            });
        }

        let total_chunks = compute_chunks(file_size, chunk_size)?;
        let file_hash = hasher::hash_file(&path)
            .await
            .map_err(|e| TransferError::Io(format!("failed to hash {source}: {e}")))?;

        let meta = DownloadMeta {
            task_id: task_id.to_string(),
            path,
            file_size,
            file_hash: file_hash.clone(),
            chunk_size,
            total_chunks,
            source_mtime: mtime_secs(&metadata),
            created_at: Instant::now(),
        };
        let progress = DownloadProgress {
            chunks_served: vec![false; total_chunks as usize],
            bytes_served: 0,
            last_activity: Instant::now(),
        };

        let replaced = self
            .transfers
            .write()
            .await
            .insert(task_id.to_string(), Transfer { meta, progress })
            .is_some();
        if replaced {
            warn!(task_id, "Replaced existing transfer registration");
        }

        info!(task_id, source, file_size, total_chunks, chunk_size, "Download registered");

        Ok(Registered {
            file_size,
            file_hash,
            chunk_size,
            total_chunks,
        })
    }

    /// Read chunk `index` of the download registered under `task_id`.
    ///
    /// Every chunk but the last is exactly `chunk_size` bytes.
    pub async fn serve_chunk(&self, task_id: &str, index: u32) -> Result<Vec<u8>, TransferError> {
        let (path, offset, len, expected_size, expected_mtime) = {
            let transfers = self.transfers.read().await;
            let t = transfers
                .get(task_id)
                .ok_or_else(|| TransferError::NotFound(task_id.to_string()))?;
            if index >= t.meta.total_chunks {
                return Err(TransferError::OutOfRange {
                    index,
                    total: t.meta.total_chunks,
                });
            }
            let offset = u64::from(index) * u64::from(t.meta.chunk_size);
            let len = u64::from(t.meta.chunk_size).min(t.meta.file_size.saturating_sub(offset));
            (
                t.meta.path.clone(),
                offset,
                len,
                t.meta.file_size,
                t.meta.source_mtime,
            )
        };

        // Lock released for the disk I/O.
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| TransferError::Io(format!("failed to open source: {e}")))?;
        let meta = file
            .metadata()
            .await
            .map_err(|e| TransferError::Io(format!("failed to stat source: {e}")))?;
        if meta.len() != expected_size || mtime_secs(&meta) != expected_mtime {
            warn!(task_id, chunk = index, "Source changed during transfer");
            return Err(TransferError::FileChanged);
        }

        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| TransferError::Io(format!("seek failed: {e}")))?;
        #[allow(clippy::cast_possible_truncation)]
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| TransferError::Io(format!("read failed: {e}")))?;

        let mut transfers = self.transfers.write().await;
        if let Some(t) = transfers.get_mut(task_id) {
            t.progress.last_activity = Instant::now();
            if let Some(slot) = t.progress.chunks_served.get_mut(index as usize) {
                if !*slot {
                    *slot = true;
                    t.progress.bytes_served += len;
                }
            }
        }

        Ok(buf)
    }

    /// Release the entry once the download task has a result.
    pub async fn finish(&self, task_id: &str) -> Option<TransferSummary> {
        let t = self.transfers.write().await.remove(task_id)?;
        let summary = summarize(&t);
        info!(
            task_id,
            chunks_served = summary.chunks_served,
            total_chunks = summary.total_chunks,
            elapsed_ms = summary.elapsed_ms,
            "Transfer released"
        );
        Some(summary)
    }

    pub async fn list(&self) -> Vec<TransferSummary> {
        let transfers = self.transfers.read().await;
        let mut out: Vec<TransferSummary> = transfers.values().map(summarize).collect();
        out.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        out
    }

    /// Drop entries idle longer than the stale timeout. Returns removed ids.
    pub async fn sweep_stale(&self) -> Vec<String> {
        let timeout = std::time::Duration::from_secs(self.config.stale_timeout_secs);
        let mut transfers = self.transfers.write().await;
        let stale: Vec<String> = transfers
            .iter()
            .filter(|(_, t)| t.progress.last_activity.elapsed() > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            transfers.remove(id);
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "Swept stale transfers");
        }
        stale
    }
}

/// Total chunks for a file of `file_size` bytes. An empty file still has one
/// (empty) chunk. Fails when the count does not fit a `u32` chunk index.
pub fn compute_chunks(file_size: u64, chunk_size: u32) -> Result<u32, TransferError> {
    let too_many = || TransferError::TooManyChunks {
        file_size,
        chunk_size,
    };
    if chunk_size == 0 {
        return Err(too_many());
    }
    if file_size == 0 {
        return Ok(1);
    }
    u32::try_from(file_size.div_ceil(u64::from(chunk_size))).map_err(|_| too_many())
}

/// Expected length of chunk `index`.
pub fn chunk_len(file_size: u64, chunk_size: u32, index: u32) -> u64 {
    let offset = u64::from(index) * u64::from(chunk_size);
    u64::from(chunk_size).min(file_size.saturating_sub(offset))
}

fn summarize(t: &Transfer) -> TransferSummary {
    #[allow(clippy::cast_possible_truncation)]
    let chunks_served = t.progress.chunks_served.iter().filter(|&&v| v).count() as u32;
    #[allow(clippy::cast_possible_truncation)]
    let elapsed_ms = t.meta.created_at.elapsed().as_millis() as u64;
    TransferSummary {
        task_id: t.meta.task_id.clone(),
        path: t.meta.path.to_string_lossy().into_owned(),
        file_size: t.meta.file_size,
        chunk_size: t.meta.chunk_size,
        total_chunks: t.meta.total_chunks,
        chunks_served,
        bytes_served: t.progress.bytes_served,
        elapsed_ms,
    }
}

fn mtime_secs(meta: &std::fs::Metadata) -> Option<u64> {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
}

fn validate_transfer_path(path: &str) -> Result<PathBuf, TransferError> {
    let p = Path::new(path);
    if !p.is_absolute() {
        return Err(TransferError::InvalidPath("path must be absolute".into()));
    }
    if path.contains('\0') {
        return Err(TransferError::InvalidPath("path contains null bytes".into()));
    }
    if p
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(TransferError::InvalidPath("path traversal (..) not allowed".into()));
    }
    Ok(p.to_path_buf())
}
