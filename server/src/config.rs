//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `SKIFF_API_KEY`, `SKIFF_BEACON_KEY`,
//!    `SKIFF_LISTEN`
//! 2. **Config file**: path via `--config <path>`, or `skiff.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8443"
//!
//! [auth]
//! api_key = "operator-secret"
//! beacon_key = "beacon-secret"
//!
//! [tasks]
//! legacy_encoding = "gbk"      # tried after UTF-8 when decoding output
//! loot_dir = "./loot"
//!
//! [transfer]
//! chunk_size = 524288          # 512 KiB
//! min_chunk_size = 4096
//! max_chunk_size = 8388608      # 8 MiB
//! max_file_size = 4294967296   # 4 GiB
//! stale_timeout_secs = 3600
//!
//! [tunnel]
//! queue_depth = 64
//! push_timeout_ms = 1000
//! inbound_timeout_ms = 100
//! retention_secs = 300
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_CONFIG_FILE: &str = "skiff.toml";

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
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8443`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// Two independent bearer keys: one for operators, one for beacons.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Operator key. Override with `SKIFF_API_KEY`.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
    /// Key beacons present on check-in and chunk fetch. Override with
    /// `SKIFF_BEACON_KEY`.
    #[serde(default = "default_beacon_key")]
    pub beacon_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TasksConfig {
    /// WHATWG label of the codepage tried after UTF-8 (default `gbk`).
    #[serde(default = "default_legacy_encoding")]
    pub legacy_encoding: String,
    /// Where uploaded artifacts land (default `./loot`).
    #[serde(default = "default_loot_dir")]
    pub loot_dir: String,
}

/// Chunk pull protocol, sending side.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    /// Default chunk size when the download request names none (default 512 KiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
    /// Smallest chunk size a download request may ask for (default 4 KiB).
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: u32,
    /// Largest chunk size a download request may ask for (default 8 MiB).
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u32,
    /// Largest file a download may register (default 4 GiB).
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Idle seconds before a transfer entry is swept (default 3600).
    #[serde(default = "default_stale_timeout_secs")]
    pub stale_timeout_secs: u64,
}

/// Server-side tunnel registry limits.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Depth of each per-tunnel inbound and outbound queue (default 64).
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// How long `push_outbound` waits for queue space (default 1000 ms).
    #[serde(default = "default_push_timeout_ms")]
    pub push_timeout_ms: u64,
    /// How long beacon DATA waits for inbound queue space (default 100 ms).
    #[serde(default = "default_inbound_timeout_ms")]
    pub inbound_timeout_ms: u64,
    /// How long closed tunnels stay listable (default 300 s).
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8443".to_string()
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_beacon_key() -> String {
    "change-me-too".to_string()
}
fn default_legacy_encoding() -> String {
    "gbk".to_string()
}
fn default_loot_dir() -> String {
    "./loot".to_string()
}
fn default_chunk_size() -> u32 {
    512 * 1024
}
fn default_min_chunk_size() -> u32 {
    4 * 1024
}
fn default_max_chunk_size() -> u32 {
    8 * 1024 * 1024
}
fn default_max_file_size() -> u64 {
    4 * 1024 * 1024 * 1024
}
fn default_stale_timeout_secs() -> u64 {
    3600
}
fn default_queue_depth() -> usize {
    64
}
fn default_push_timeout_ms() -> u64 {
    1000
}
fn default_inbound_timeout_ms() -> u64 {
    100
}
fn default_retention_secs() -> u64 {
    300
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
            beacon_key: default_beacon_key(),
        }
    }
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            legacy_encoding: default_legacy_encoding(),
            loot_dir: default_loot_dir(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            min_chunk_size: default_min_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
            max_file_size: default_max_file_size(),
            stale_timeout_secs: default_stale_timeout_secs(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
            push_timeout_ms: default_push_timeout_ms(),
            inbound_timeout_ms: default_inbound_timeout_ms(),
            retention_secs: default_retention_secs(),
        }
    }
}

impl TunnelConfig {
    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }

    pub fn inbound_timeout(&self) -> Duration {
        Duration::from_millis(self.inbound_timeout_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist and parse. Otherwise
    /// `skiff.toml` in the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(DEFAULT_CONFIG_FILE)?
            }
            None => Config::default(),
        };

        if let Ok(key) = std::env::var("SKIFF_API_KEY") {
            config.auth.api_key = key;
        }
        if let Ok(key) = std::env::var("SKIFF_BEACON_KEY") {
            config.auth.beacon_key = key;
        }
        if let Ok(listen) = std::env::var("SKIFF_LISTEN") {
            config.server.listen = listen;
        }

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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults_for_missing_sections() {
        let config: Config = toml::from_str(
            r#"
            [tasks]
            legacy_encoding = "shift_jis"

            [tunnel]
            push_timeout_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.tasks.legacy_encoding, "shift_jis");
        assert_eq!(config.tasks.loot_dir, "./loot");
        assert_eq!(config.tunnel.push_timeout(), Duration::from_millis(250));
        assert_eq!(config.tunnel.queue_depth, 64);
        assert_eq!(config.transfer.chunk_size, 512 * 1024);
        assert_eq!(config.transfer.min_chunk_size, 4 * 1024);
        assert_eq!(config.transfer.max_chunk_size, 8 * 1024 * 1024);
        assert_eq!(config.server.listen, "0.0.0.0:8443");
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let err = Config::load(Some("/nonexistent/skiff.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[server\nlisten = 1").unwrap();
        let err = Config::load(Some(path.to_str().unwrap())).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
