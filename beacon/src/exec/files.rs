//! `download` (server → beacon) and `upload` (beacon → server) file tasks.

use std::path::Path;

use async_trait::async_trait;

use skiff::protocol::{DownloadPayload, UploadOutput};
use skiff::util::expand_tilde;

use super::{ExecContext, ExecError, Executor};
use crate::transfer::fetch_download;

/// Pulls the file described by a [`DownloadPayload`] chunk by chunk.
pub struct DownloadExecutor;

#[async_trait]
impl Executor for DownloadExecutor {
    async fn execute(
        &self,
        ctx: &ExecContext,
        task_id: &str,
        args: &[u8],
    ) -> Result<Vec<u8>, ExecError> {
        let payload: DownloadPayload = serde_json::from_slice(args)
            .map_err(|e| ExecError::InvalidArguments(format!("bad download payload: {e}")))?;
        let fetched = fetch_download(ctx.chunks.as_ref(), task_id, &payload).await?;
        Ok(format!(
            "downloaded {} bytes in {} chunks to {} (sha256 {})",
            fetched.bytes,
            fetched.chunks,
            fetched.path.display(),
            fetched.sha256
        )
        .into_bytes())
    }
}

/// Reads a local file and returns it as an [`UploadOutput`] document.
pub struct UploadExecutor;

#[async_trait]
impl Executor for UploadExecutor {
    async fn execute(
        &self,
        ctx: &ExecContext,
        _task_id: &str,
        args: &[u8],
    ) -> Result<Vec<u8>, ExecError> {
        let raw = String::from_utf8_lossy(args);
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ExecError::InvalidArguments("missing file path".into()));
        }
        let path = expand_tilde(raw).into_owned();
        let io_err = |source| ExecError::Io {
            path: path.clone(),
            source,
        };

        let meta = tokio::fs::metadata(&path).await.map_err(io_err)?;
        if !meta.is_file() {
            return Err(ExecError::InvalidArguments(format!("{path} is not a regular file")));
        }
        if meta.len() > ctx.config.max_upload_bytes {
            return Err(ExecError::TooLarge {
                path: path.clone(),
                size: meta.len(),
                max: ctx.config.max_upload_bytes,
            });
        }
        let content = tokio::fs::read(&path).await.map_err(io_err)?;

        let filename = Path::new(&path)
            .file_name()
            .map_or_else(|| "upload".to_string(), |n| n.to_string_lossy().into_owned());
        serde_json::to_vec(&UploadOutput { filename, content })
            .map_err(|e| ExecError::ProcessFailed(format!("encode upload output: {e}")))
    }
}
