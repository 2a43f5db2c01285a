//! Chunked file transfer, sending side.
//!
//! | Piece | Role |
//! |-------|------|
//! | [`manager::TransferManager`] | transfer table, seek + read chunk serving |
//! | [`types`] | metadata and progress records, summaries, [`TransferError`] |
//!
//! The receiving side lives in the beacon crate and shares
//! [`compute_chunks`] and [`chunk_len`] so both ends agree on chunk layout.

pub mod manager;
pub mod types;

pub use manager::{chunk_len, compute_chunks, Registered, TransferManager};
pub use types::{TransferError, TransferSummary};
