//! Chunk pull protocol, receiving side.
//!
//! A `download` task carries a [`DownloadPayload`]. The beacon fetches chunks
//! `0..total_chunks` in order, appends each to a temp file beside the
//! destination, checks the SHA-256 at the end, and only then renames the temp
//! file into place. Any failure removes the temp file; the destination is
//! never left half-written.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use skiff::protocol::DownloadPayload;
use skiff::transfer::{chunk_len, compute_chunks, TransferError};
use skiff::util::expand_tilde;

use crate::client::{ChunkSource, ClientError};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("chunk size must be non-zero")]
    InvalidChunkSize,
    #[error(transparent)]
    Layout(#[from] TransferError),
    #[error("chunk {index}: {source}")]
    Chunk { index: u32, source: ClientError },
    #[error("chunk {index}: expected {expected} bytes, got {actual}")]
    Length { index: u32, expected: u64, actual: u64 },
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

/// Where a download lands once verified.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub path: PathBuf,
    pub bytes: u64,
    pub chunks: u32,
    pub sha256: String,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> FetchError + '_ {
    move |source| FetchError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn temp_path(dest: &Path, task_id: &str) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    dest.with_file_name(format!(".{name}.{task_id}.part"))
}

/// Fetch every chunk of `payload` and install it at its destination.
pub async fn fetch_download(
    source: &dyn ChunkSource,
    task_id: &str,
    payload: &DownloadPayload,
) -> Result<Fetched, FetchError> {
    if payload.chunk_size == 0 {
        return Err(FetchError::InvalidChunkSize);
    }
    let dest = PathBuf::from(expand_tilde(&payload.destination).into_owned());
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(io_err(parent))?;
    }
    let tmp = temp_path(&dest, task_id);

    match fetch_into(source, task_id, payload, &tmp).await {
        Ok((chunks, sha256)) => {
            if let Err(e) = tokio::fs::rename(&tmp, &dest).await {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(io_err(&dest)(e));
            }
            info!(
                task_id,
                path = %dest.display(),
                bytes = payload.file_size,
                chunks,
                "Download installed"
            );
            Ok(Fetched {
                path: dest,
                bytes: payload.file_size,
                chunks,
                sha256,
            })
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(e)
        }
    }
}

async fn fetch_into(
    source: &dyn ChunkSource,
    task_id: &str,
    payload: &DownloadPayload,
    tmp: &Path,
) -> Result<(u32, String), FetchError> {
    let total = compute_chunks(payload.file_size, payload.chunk_size)?;
    let mut file = tokio::fs::File::create(tmp).await.map_err(io_err(tmp))?;
    let mut hasher = Sha256::new();

    for index in 0..total {
        let data = source
            .fetch_chunk(task_id, index)
            .await
            .map_err(|source| FetchError::Chunk { index, source })?;
        let expected = chunk_len(payload.file_size, payload.chunk_size, index);
        if data.len() as u64 != expected {
            return Err(FetchError::Length {
                index,
                expected,
                actual: data.len() as u64,
            });
        }
        hasher.update(&data);
        file.write_all(&data).await.map_err(io_err(tmp))?;
        debug!(task_id, index, total, "Chunk written");
    }
    file.flush().await.map_err(io_err(tmp))?;
    file.sync_all().await.map_err(io_err(tmp))?;
    drop(file);

    let actual = hex::encode(hasher.finalize());
    if !payload.file_hash.is_empty() && !payload.file_hash.eq_ignore_ascii_case(&actual) {
        return Err(FetchError::HashMismatch {
            expected: payload.file_hash.clone(),
            actual,
        });
    }
    Ok((total, actual))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use skiff::config::TransferConfig;
    use skiff::transfer::TransferManager;

    /// Serves chunks straight from a server-side [`TransferManager`].
    pub(crate) struct LocalChunks(pub Arc<TransferManager>);

    #[async_trait]
    impl ChunkSource for LocalChunks {
        async fn fetch_chunk(&self, task_id: &str, index: u32) -> Result<Vec<u8>, ClientError> {
            self.0
                .serve_chunk(task_id, index)
                .await
                .map_err(|e| ClientError::Server {
                    status: 404,
                    message: e.to_string(),
                })
        }
    }

    fn manager() -> Arc<TransferManager> {
        Arc::new(TransferManager::new(TransferConfig {
            min_chunk_size: 1,
            ..TransferConfig::default()
        }))
    }

    async fn register(
        mgr: &TransferManager,
        task_id: &str,
        src: &Path,
        dest: &Path,
        chunk_size: u32,
    ) -> DownloadPayload {
        let reg = mgr
            .register(task_id, src.to_str().unwrap(), Some(chunk_size))
            .await
            .unwrap();
        DownloadPayload {
            source: src.display().to_string(),
            destination: dest.display().to_string(),
            file_size: reg.file_size,
            chunk_size: reg.chunk_size,
            file_hash: reg.file_hash,
        }
    }

    #[tokio::test]
    async fn three_chunk_download_matches_source() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let content: Vec<u8> = (0..2_500_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&src, &content).unwrap();
        let dest = dir.path().join("out").join("copy.bin");

        let mgr = manager();
        let payload = register(&mgr, "t1", &src, &dest, 1_000_000).await;
        let fetched = fetch_download(&LocalChunks(mgr), "t1", &payload).await.unwrap();

        assert_eq!(fetched.chunks, 3);
        assert_eq!(fetched.bytes, 2_500_000);
        assert_eq!(std::fs::read(&dest).unwrap(), content);
        assert_eq!(fetched.sha256, payload.file_hash);
    }

    #[tokio::test]
    async fn empty_file_is_one_empty_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("empty");
        std::fs::write(&src, b"").unwrap();
        let dest = dir.path().join("empty.copy");

        let mgr = manager();
        let payload = register(&mgr, "t2", &src, &dest, 4096).await;
        let fetched = fetch_download(&LocalChunks(mgr), "t2", &payload).await.unwrap();
        assert_eq!(fetched.chunks, 1);
        assert_eq!(std::fs::read(&dest).unwrap(), b"");
    }

    #[tokio::test]
    async fn hash_mismatch_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::write(&src, b"hello world").unwrap();
        let dest = dir.path().join("dest");

        let mgr = manager();
        let mut payload = register(&mgr, "t3", &src, &dest, 4).await;
        payload.file_hash = "00".repeat(32);
        let err = fetch_download(&LocalChunks(mgr), "t3", &payload).await.unwrap_err();
        assert!(matches!(err, FetchError::HashMismatch { .. }));
        assert!(!dest.exists());
        assert!(!temp_path(&dest, "t3").exists());
    }

    #[tokio::test]
    async fn failed_chunk_reports_its_index() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("dest");
        let payload = DownloadPayload {
            source: "/nowhere".into(),
            destination: dest.display().to_string(),
            file_size: 10,
            chunk_size: 4,
            file_hash: String::new(),
        };
        let mgr = manager();
        let err = fetch_download(&LocalChunks(mgr), "unregistered", &payload)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Chunk { index: 0, .. }));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn short_chunk_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::write(&src, b"0123456789").unwrap();
        let dest = dir.path().join("dest");

        let mgr = manager();
        let mut payload = register(&mgr, "t4", &src, &dest, 4).await;
        // Claim a larger file than the one registered: chunk 2 comes back short.
        payload.file_size = 12;
        payload.file_hash.clear();
        let err = fetch_download(&LocalChunks(mgr), "t4", &payload).await.unwrap_err();
        assert!(matches!(
            err,
            FetchError::Length { index: 2, expected: 4, actual: 2 }
        ));
    }

    #[tokio::test]
    async fn unindexable_layout_fails_before_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("dest");
        let payload = DownloadPayload {
            source: "/nowhere".into(),
            destination: dest.display().to_string(),
            file_size: 1 << 32,
            chunk_size: 1,
            file_hash: String::new(),
        };
        let err = fetch_download(&LocalChunks(manager()), "t5", &payload)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FetchError::Layout(TransferError::TooManyChunks { .. })
        ));
        assert!(!dest.exists());
        assert!(!temp_path(&dest, "t5").exists());
    }
}
