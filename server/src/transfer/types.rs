//! Types for the chunk pull protocol (sending side).

use std::path::PathBuf;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;

/// Immutable metadata captured when a download task is dispatched.
pub struct DownloadMeta {
    pub task_id: String,
    pub path: PathBuf,
    pub file_size: u64,
    pub file_hash: String,
    pub chunk_size: u32,
    pub total_chunks: u32,
    /// Source mtime at registration, to detect edits mid-transfer.
    pub source_mtime: Option<u64>,
    pub created_at: Instant,
}

/// Mutable progress of one download.
pub struct DownloadProgress {
    pub chunks_served: Vec<bool>,
    pub bytes_served: u64,
    pub last_activity: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferSummary {
    pub task_id: String,
    pub path: String,
    pub file_size: u64,
    pub chunk_size: u32,
    pub total_chunks: u32,
    pub chunks_served: u32,
    pub bytes_served: u64,
    pub elapsed_ms: u64,
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("no transfer registered for task '{0}'")]
    NotFound(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("source file not found: {0}")]
    FileNotFound(String),
    #[error("file too large ({size} bytes, max {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("chunk size {size} outside allowed range {min}..={max}")]
    InvalidChunkSize { size: u32, min: u32, max: u32 },
    #[error("{file_size} bytes in {chunk_size}-byte chunks exceeds the chunk index range")]
    TooManyChunks { file_size: u64, chunk_size: u32 },
    #[error("chunk {index} out of range (total {total})")]
    OutOfRange { index: u32, total: u32 },
    #[error("source file modified during transfer")]
    FileChanged,
    #[error("i/o error: {0}")]
    Io(String),
}

impl TransferError {
    /// Stable machine-readable code for HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "TRANSFER_NOT_FOUND",
            Self::InvalidPath(_) => "INVALID_PATH",
            Self::FileNotFound(_) => "FILE_NOT_FOUND",
            Self::TooLarge { .. } => "FILE_TOO_LARGE",
            Self::InvalidChunkSize { .. } | Self::TooManyChunks { .. } => "INVALID_REQUEST",
            Self::OutOfRange { .. } => "INVALID_REQUEST",
            Self::FileChanged => "FILE_CHANGED",
            Self::Io(_) => "IO_ERROR",
        }
    }
}
