#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! skiff library: task dispatch and tunnel relay engine.
//!
//! The beacon crate links this library for [`protocol`] and
//! [`commands::registry`]; the server binary uses everything.
//!
//! - `protocol`: wire types shared with beacons
//! - `commands`: command registry and server-side converters
//! - `tasks`: task lifecycle manager and output decoding
//! - `transfer`: chunk pull protocol, sending side
//! - `tunnel`: server-side tunnel registry
//! - `checkin`: one beacon poll, end to end
//! - `store`: persistence collaborator and in-memory store
//! - `loot`: on-disk store for uploaded artifacts
//! - `routes`: REST API route handlers
//! - `auth`: bearer key middleware
//! - `config`: configuration loading

pub mod auth;
pub mod checkin;
pub mod commands;
pub mod config;
pub mod hasher;
pub mod loot;
pub mod protocol;
pub mod routes;
pub mod state;
pub mod store;
pub mod tasks;
pub mod transfer;
pub mod tunnel;
pub mod util;

pub use config::Config;
pub use state::AppState;
