#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

//! skiff-beacon library: the polling agent.
//!
//! - `agent`: the poll loop
//! - `client`: HTTP transport to the server
//! - `exec`: command handlers
//! - `transfer`: chunked download fetcher
//! - `tunnel`: TCP side of the tunnel relay
//! - `sleep`: jittered poll interval
//! - `config`: configuration loading

pub mod agent;
pub mod client;
pub mod config;
pub mod exec;
pub mod sleep;
pub mod transfer;
pub mod tunnel;

pub use agent::Agent;
pub use config::BeaconConfig;
