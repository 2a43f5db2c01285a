//! Server-side converters: task arguments → wire bytes.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::{DownloadPayload, DownloadRequest};
use crate::tasks::types::Task;
use crate::transfer::{TransferError, TransferManager};

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// Encodes one task's arguments for the wire. May consult external state.
#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(&self, task: &Task) -> Result<Vec<u8>, ConvertError>;
}

/// Passes arguments through untouched (`shell`, `upload`, `exit`).
pub struct Verbatim;

#[async_trait]
impl Converter for Verbatim {
    async fn convert(&self, task: &Task) -> Result<Vec<u8>, ConvertError> {
        Ok(task.arguments.clone())
    }
}

/// Validates `"<secs> [jitter]"` and forwards it verbatim.
pub struct SleepConverter;

#[async_trait]
impl Converter for SleepConverter {
    async fn convert(&self, task: &Task) -> Result<Vec<u8>, ConvertError> {
        let text = std::str::from_utf8(&task.arguments)
            .map_err(|_| ConvertError::InvalidArguments("sleep arguments are not UTF-8".into()))?;
        super::parse_sleep_args(text).map_err(ConvertError::InvalidArguments)?;
        Ok(task.arguments.clone())
    }
}

/// Registers the source with the transfer table and emits a [`DownloadPayload`].
///
/// Arguments are either a [`DownloadRequest`] JSON object or the short form
/// `"<source> <destination>"`.
pub struct DownloadConverter {
    transfers: Arc<TransferManager>,
}

impl DownloadConverter {
    pub fn new(transfers: Arc<TransferManager>) -> Self {
        Self { transfers }
    }
}

#[async_trait]
impl Converter for DownloadConverter {
    async fn convert(&self, task: &Task) -> Result<Vec<u8>, ConvertError> {
        let req = parse_download_request(&task.arguments)?;
        let reg = self
            .transfers
            .register(&task.task_id, &req.source, req.chunk_size)
            .await?;
        let payload = DownloadPayload {
            source: req.source,
            destination: req.destination,
            file_size: reg.file_size,
            chunk_size: reg.chunk_size,
            file_hash: reg.file_hash,
        };
        serde_json::to_vec(&payload).map_err(|e| ConvertError::InvalidArguments(e.to_string()))
    }
}

fn parse_download_request(raw: &[u8]) -> Result<DownloadRequest, ConvertError> {
    if let Ok(req) = serde_json::from_slice::<DownloadRequest>(raw) {
        return Ok(req);
    }
    let text = std::str::from_utf8(raw)
        .map_err(|_| ConvertError::InvalidArguments("download arguments are not UTF-8".into()))?;
    let mut parts = text.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(source), Some(destination), None) => Ok(DownloadRequest {
            source: source.to_string(),
            destination: destination.to_string(),
            chunk_size: None,
        }),
        _ => Err(ConvertError::InvalidArguments(
            "expected JSON {source, destination} or \"<source> <destination>\"".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferConfig;
    use crate::tasks::types::{TaskOrigin, TaskStatus};

    fn task(command: &str, args: &[u8]) -> Task {
        Task {
            task_id: "t1".into(),
            beacon_id: "b1".into(),
            command: command.into(),
            arguments: args.to_vec(),
            status: TaskStatus::Queued,
            output: String::new(),
            origin: TaskOrigin::Operator("alice".into()),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn sleep_validation() {
        let ok = SleepConverter.convert(&task("sleep", b"30 20")).await.unwrap();
        assert_eq!(ok, b"30 20");
        assert!(SleepConverter.convert(&task("sleep", b"soon")).await.is_err());
        assert!(SleepConverter.convert(&task("sleep", b"5 150")).await.is_err());
        assert!(SleepConverter.convert(&task("sleep", b"")).await.is_err());
    }

    #[tokio::test]
    async fn download_registers_and_describes_source() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("notes.txt");
        std::fs::write(&src, b"0123456789").unwrap();

        let transfers = Arc::new(TransferManager::new(TransferConfig {
            min_chunk_size: 1,
            ..TransferConfig::default()
        }));
        let conv = DownloadConverter::new(transfers.clone());
        let args = serde_json::json!({
            "source": src.to_str().unwrap(),
            "destination": "/tmp/notes.txt",
            "chunk_size": 4,
        });
        let bytes = conv
            .convert(&task("download", args.to_string().as_bytes()))
            .await
            .unwrap();

        let payload: DownloadPayload = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(payload.file_size, 10);
        assert_eq!(payload.chunk_size, 4);
        assert_eq!(payload.destination, "/tmp/notes.txt");
        assert_eq!(transfers.serve_chunk("t1", 2).await.unwrap(), b"89");
    }

    #[tokio::test]
    async fn download_short_form_and_missing_source() {
        let transfers = Arc::new(TransferManager::new(TransferConfig::default()));
        let conv = DownloadConverter::new(transfers);
        let err = conv
            .convert(&task("download", b"/no/such/file /tmp/out"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConvertError::Transfer(TransferError::FileNotFound(_))));

        let err = conv.convert(&task("download", b"just-one")).await.unwrap_err();
        assert!(matches!(err, ConvertError::InvalidArguments(_)));
    }
}
