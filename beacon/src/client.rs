//! HTTP transport to the skiff server.
//!
//! [`BeaconClient`] wraps `reqwest::Client` and speaks the two beacon
//! endpoints: the check-in exchange and the download chunk fetch. Both use
//! Bearer authentication with the beacon key.
//!
//! Non-2xx responses are parsed for an `error` field in the JSON body. If
//! parsing fails, the raw response body becomes the error message.
//!
//! The agent and the download fetcher only see the [`Transport`] and
//! [`ChunkSource`] traits, so tests can drive them without a network.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use skiff::protocol::{CheckIn, CheckInResponse};

/// Performs one poll exchange.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn check_in(&self, request: &CheckIn) -> Result<CheckInResponse, ClientError>;
}

/// Fetches one chunk of a registered download.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    async fn fetch_chunk(&self, task_id: &str, index: u32) -> Result<Vec<u8>, ClientError>;
}

/// Errors returned by [`BeaconClient`] methods.
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP transport error (connection refused, timeout, DNS failure, etc.).
    #[error("HTTP error: {0}")]
    Request(#[from] reqwest::Error),
    /// The server returned a non-2xx HTTP status.
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
    /// The response body was not what the protocol expects.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Server { status: 404, .. })
    }
}

/// HTTP client for one skiff server.
pub struct BeaconClient {
    http: reqwest::Client,
    base_url: String,
    beacon_key: String,
}

impl BeaconClient {
    pub fn new(
        base_url: &str,
        beacon_key: String,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("skiff-beacon/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            beacon_key,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn error_from(resp: reqwest::Response) -> ClientError {
        let status = resp.status();
        let body = match resp.text().await {
            Ok(b) => b,
            Err(e) => return ClientError::Request(e),
        };
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v["error"].as_str().map(String::from))
            .unwrap_or(body);
        ClientError::Server {
            status: status.as_u16(),
            message,
        }
    }
}

#[async_trait]
impl Transport for BeaconClient {
    /// `POST /api/beacon/checkin`
    async fn check_in(&self, request: &CheckIn) -> Result<CheckInResponse, ClientError> {
        let resp = self
            .http
            .post(format!("{}/api/beacon/checkin", self.base_url))
            .bearer_auth(&self.beacon_key)
            .json(request)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::error_from(resp).await);
        }
        let body = resp.text().await?;
        serde_json::from_str(&body)
            .map_err(|e| ClientError::Protocol(format!("invalid check-in response: {e}")))
    }
}

#[async_trait]
impl ChunkSource for BeaconClient {
    /// `GET /api/beacon/chunk/{task_id}/{index}`
    async fn fetch_chunk(&self, task_id: &str, index: u32) -> Result<Vec<u8>, ClientError> {
        let resp = self
            .http
            .get(format!(
                "{}/api/beacon/chunk/{}/{}",
                self.base_url, task_id, index
            ))
            .bearer_auth(&self.beacon_key)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::error_from(resp).await);
        }
        Ok(resp.bytes().await?.to_vec())
    }
}
