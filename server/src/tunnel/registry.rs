//! Server-side tunnel registry.
//!
//! One table of tunnels plus a beacon → tunnel-id index, both behind a single
//! lock. Callers never touch the queues directly; every transition goes
//! through a registry method.
//!
//! ```text
//!            ack ok              STOP / fin / close
//! pending ─────────→ active ───────────────────────→ closed
//!    │                  │
//!    │ ack error        │ STOP with is_error
//!    └────────→ error ←─┘
//! ```
//!
//! Each tunnel owns two bounded queues. *Outbound* holds messages for the
//! beacon and is drained on every poll. *Inbound* holds DATA from the beacon
//! until the operator pulls it. No lock is held while waiting for queue space.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TunnelConfig;
use crate::protocol::{TunnelCommand, TunnelMessage};
use crate::util::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Pending,
    Active,
    Closed,
    Error,
}

impl TunnelStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TunnelError {
    #[error("tunnel '{0}' not found")]
    NotFound(String),
    #[error("tunnel '{tunnel_id}' is {status:?}, not active")]
    NotActive {
        tunnel_id: String,
        status: TunnelStatus,
    },
    #[error("timed out queueing data for tunnel '{0}'")]
    Timeout(String),
    #[error("tunnel '{0}' closed while queueing data")]
    Closed(String),
    #[error("invalid target '{0}': expected host:port")]
    InvalidTarget(String),
}

impl TunnelError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "TUNNEL_NOT_FOUND",
            Self::NotActive { .. } => "TUNNEL_NOT_ACTIVE",
            Self::Timeout(_) => "TUNNEL_TIMEOUT",
            Self::Closed(_) => "TUNNEL_CLOSED",
            Self::InvalidTarget(_) => "INVALID_TARGET",
        }
    }
}

/// Point-in-time view of one tunnel.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelInfo {
    pub tunnel_id: String,
    pub beacon_id: String,
    pub target: String,
    pub operator: String,
    pub status: TunnelStatus,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub inbound_pending: usize,
    pub outbound_pending: usize,
}

struct TunnelEntry {
    tunnel_id: String,
    beacon_id: String,
    target: String,
    operator: String,
    status: TunnelStatus,
    outbound_tx: mpsc::Sender<TunnelMessage>,
    outbound_rx: mpsc::Receiver<TunnelMessage>,
    inbound_tx: mpsc::Sender<TunnelMessage>,
    inbound_rx: mpsc::Receiver<TunnelMessage>,
    cancel: CancellationToken,
    /// Explicit close still owes the beacon a STOP.
    stop_pending: bool,
    last_error: Option<String>,
    created_at: u64,
    updated_at: u64,
    closed_at: Option<Instant>,
}

impl TunnelEntry {
    fn info(&self) -> TunnelInfo {
        TunnelInfo {
            tunnel_id: self.tunnel_id.clone(),
            beacon_id: self.beacon_id.clone(),
            target: self.target.clone(),
            operator: self.operator.clone(),
            status: self.status,
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_error: self.last_error.clone(),
            inbound_pending: self.inbound_rx.len(),
            outbound_pending: self.outbound_rx.len(),
        }
    }

    /// Move to a terminal status. Idempotent; the first terminal status wins.
    fn finish(&mut self, status: TunnelStatus, error: Option<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        if error.is_some() {
            self.last_error = error;
        }
        self.updated_at = now_ms();
        self.closed_at = Some(Instant::now());
        self.cancel.cancel();
        // Blocked and future pushes fail; already-buffered messages still drain.
        self.outbound_rx.close();
        true
    }

    fn is_drained(&self) -> bool {
        !self.stop_pending && self.outbound_rx.is_empty() && self.inbound_rx.is_empty()
    }
}

#[derive(Default)]
struct Inner {
    tunnels: HashMap<String, TunnelEntry>,
    by_beacon: HashMap<String, HashSet<String>>,
}

impl Inner {
    fn remove(&mut self, tunnel_id: &str) -> Option<TunnelEntry> {
        let entry = self.tunnels.remove(tunnel_id)?;
        if let Some(ids) = self.by_beacon.get_mut(&entry.beacon_id) {
            ids.remove(tunnel_id);
            if ids.is_empty() {
                self.by_beacon.remove(&entry.beacon_id);
            }
        }
        Some(entry)
    }
}

pub struct TunnelRegistry {
    inner: RwLock<Inner>,
    config: TunnelConfig,
    dropped_inbound: AtomicU64,
}

impl TunnelRegistry {
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            config,
            dropped_inbound: AtomicU64::new(0),
        }
    }

    /// Create a pending tunnel and queue its START for the beacon's next poll.
    pub async fn start(
        &self,
        beacon_id: &str,
        target: &str,
        operator: &str,
    ) -> Result<TunnelInfo, TunnelError> {
        validate_target(target)?;

        let depth = self.config.queue_depth.max(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(depth);
        let (inbound_tx, inbound_rx) = mpsc::channel(depth);
        let tunnel_id = uuid::Uuid::new_v4().to_string();

        // Fresh queue with depth >= 1.
        let _ = outbound_tx.try_send(TunnelMessage::start(&tunnel_id, target));

        let now = now_ms();
        let entry = TunnelEntry {
            tunnel_id: tunnel_id.clone(),
            beacon_id: beacon_id.to_string(),
            target: target.to_string(),
            operator: operator.to_string(),
            status: TunnelStatus::Pending,
            outbound_tx,
            outbound_rx,
            inbound_tx,
            inbound_rx,
            cancel: CancellationToken::new(),
            stop_pending: false,
            last_error: None,
            created_at: now,
            updated_at: now,
            closed_at: None,
        };
        let info = entry.info();

        let mut inner = self.inner.write().await;
        inner
            .by_beacon
            .entry(beacon_id.to_string())
            .or_default()
            .insert(tunnel_id.clone());
        inner.tunnels.insert(tunnel_id.clone(), entry);
        drop(inner);

        info!(tunnel_id = %tunnel_id, beacon_id, target, operator, "Tunnel requested");
        Ok(info)
    }

    /// Queue operator data for the beacon.
    ///
    /// Only valid while `active`. Waits at most the configured push timeout
    /// for queue space and fails early if the tunnel is closed meanwhile.
    pub async fn push_outbound(
        &self,
        tunnel_id: &str,
        data: Vec<u8>,
        is_fin: bool,
    ) -> Result<(), TunnelError> {
        let (tx, cancel) = {
            let inner = self.inner.read().await;
            let entry = inner
                .tunnels
                .get(tunnel_id)
                .ok_or_else(|| TunnelError::NotFound(tunnel_id.to_string()))?;
            if entry.status != TunnelStatus::Active {
                return Err(TunnelError::NotActive {
                    tunnel_id: tunnel_id.to_string(),
                    status: entry.status,
                });
            }
            (entry.outbound_tx.clone(), entry.cancel.clone())
        };

        let msg = TunnelMessage::data(tunnel_id, data, is_fin);
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(TunnelError::Closed(tunnel_id.to_string())),
            res = tx.send_timeout(msg, self.config.push_timeout()) => match res {
                Ok(()) => Ok(()),
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    warn!(tunnel_id, "Outbound queue full, push timed out");
                    Err(TunnelError::Timeout(tunnel_id.to_string()))
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                    Err(TunnelError::Closed(tunnel_id.to_string()))
                }
            },
        }
    }

    /// Route one tunnel message submitted by `beacon_id` on check-in.
    ///
    /// Messages for unknown tunnels or tunnels owned by another beacon are
    /// ignored with a warning.
    pub async fn on_beacon_message(&self, beacon_id: &str, msg: TunnelMessage) {
        let msg = msg.normalized();
        let tunnel_id = msg.tunnel_id.clone();

        let inbound_tx = {
            let mut inner = self.inner.write().await;
            let Some(entry) = inner.tunnels.get_mut(&tunnel_id) else {
                debug!(tunnel_id = %tunnel_id, beacon_id, "Message for unknown tunnel dropped");
                return;
            };
            if entry.beacon_id != beacon_id {
                warn!(
                    tunnel_id = %tunnel_id,
                    beacon_id,
                    owner = %entry.beacon_id,
                    "Ignoring tunnel message from non-owning beacon"
                );
                return;
            }

            match msg.command {
                TunnelCommand::Start => {
                    if entry.status != TunnelStatus::Pending {
                        debug!(tunnel_id = %tunnel_id, status = ?entry.status, "Late START ack ignored");
                        return;
                    }
                    if msg.is_error {
                        let err = msg.error.clone().unwrap_or_else(|| "dial failed".into());
                        warn!(tunnel_id = %tunnel_id, error = %err, "Tunnel target unreachable");
                        entry.finish(TunnelStatus::Error, Some(err));
                    } else {
                        entry.status = TunnelStatus::Active;
                        entry.updated_at = now_ms();
                        info!(tunnel_id = %tunnel_id, target = %entry.target, "Tunnel active");
                    }
                    return;
                }
                TunnelCommand::Stop => {
                    let (status, err) = if msg.is_error {
                        (TunnelStatus::Error, msg.error.clone())
                    } else {
                        (TunnelStatus::Closed, None)
                    };
                    if entry.finish(status, err) {
                        info!(tunnel_id = %tunnel_id, status = ?status, "Tunnel stopped by beacon");
                    }
                    // Beacon already tore down; it needs no STOP back.
                    entry.stop_pending = false;
                    let _ = entry.inbound_tx.try_send(msg);
                    return;
                }
                TunnelCommand::Data => {
                    if entry.status != TunnelStatus::Active {
                        debug!(tunnel_id = %tunnel_id, status = ?entry.status, "DATA for inactive tunnel dropped");
                        return;
                    }
                    entry.inbound_tx.clone()
                }
            }
        };

        let is_fin = msg.is_fin;
        if let Err(e) = inbound_tx
            .send_timeout(msg, self.config.inbound_timeout())
            .await
        {
            let total = self.dropped_inbound.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(tunnel_id = %tunnel_id, dropped_total = total, "Inbound queue overloaded, DATA dropped: {e}");
        }

        if is_fin {
            let mut inner = self.inner.write().await;
            if let Some(entry) = inner.tunnels.get_mut(&tunnel_id) {
                if entry.finish(TunnelStatus::Closed, None) {
                    info!(tunnel_id = %tunnel_id, "Tunnel closed by remote EOF");
                }
            }
        }
    }

    /// Operator-initiated close. A STOP follows any already-buffered messages
    /// on the beacon's next poll.
    pub async fn close(&self, tunnel_id: &str) -> Result<TunnelInfo, TunnelError> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .tunnels
            .get_mut(tunnel_id)
            .ok_or_else(|| TunnelError::NotFound(tunnel_id.to_string()))?;
        if entry.finish(TunnelStatus::Closed, None) {
            entry.stop_pending = true;
            info!(tunnel_id, beacon_id = %entry.beacon_id, "Tunnel closed by operator");
        }
        Ok(entry.info())
    }

    /// Non-blocking drain of everything the beacon has sent.
    pub async fn pull_inbound(&self, tunnel_id: &str) -> Result<Vec<TunnelMessage>, TunnelError> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .tunnels
            .get_mut(tunnel_id)
            .ok_or_else(|| TunnelError::NotFound(tunnel_id.to_string()))?;
        let mut out = Vec::new();
        while let Ok(msg) = entry.inbound_rx.try_recv() {
            out.push(msg);
        }
        Ok(out)
    }

    /// Everything queued for `beacon_id`, for the check-in response.
    pub async fn drain_outbound(&self, beacon_id: &str) -> Vec<TunnelMessage> {
        let mut inner = self.inner.write().await;
        let Inner { tunnels, by_beacon } = &mut *inner;
        let Some(ids) = by_beacon.get(beacon_id) else {
            return Vec::new();
        };

        let mut entries: Vec<&mut TunnelEntry> = tunnels
            .values_mut()
            .filter(|e| ids.contains(&e.tunnel_id))
            .collect();
        entries.sort_by_key(|e| e.created_at);

        let mut out = Vec::new();
        for entry in entries {
            while let Ok(msg) = entry.outbound_rx.try_recv() {
                out.push(msg);
            }
            if entry.stop_pending {
                entry.stop_pending = false;
                out.push(TunnelMessage::stop(&entry.tunnel_id));
            }
        }
        out
    }

    /// Close every tunnel of a beacon that is gone. No STOP is queued.
    pub async fn close_beacon(&self, beacon_id: &str) -> usize {
        let mut inner = self.inner.write().await;
        let Inner { tunnels, by_beacon } = &mut *inner;
        let Some(ids) = by_beacon.get(beacon_id) else {
            return 0;
        };
        let mut closed = 0;
        for id in ids {
            if let Some(entry) = tunnels.get_mut(id) {
                if entry.finish(TunnelStatus::Closed, Some("beacon exited".into())) {
                    closed += 1;
                }
                entry.stop_pending = false;
            }
        }
        if closed > 0 {
            info!(beacon_id, count = closed, "Closed tunnels of exited beacon");
        }
        closed
    }

    pub async fn get(&self, tunnel_id: &str) -> Result<TunnelInfo, TunnelError> {
        self.inner
            .read()
            .await
            .tunnels
            .get(tunnel_id)
            .map(TunnelEntry::info)
            .ok_or_else(|| TunnelError::NotFound(tunnel_id.to_string()))
    }

    pub async fn list(&self) -> Vec<TunnelInfo> {
        let inner = self.inner.read().await;
        let mut out: Vec<TunnelInfo> = inner.tunnels.values().map(TunnelEntry::info).collect();
        out.sort_by_key(|t| t.created_at);
        out
    }

    /// Remove terminal tunnels older than `retention`. Entries that still
    /// hold undelivered messages get four times as long before removal.
    pub async fn sweep_closed(&self, retention: std::time::Duration) -> Vec<String> {
        let mut inner = self.inner.write().await;
        let expired: Vec<String> = inner
            .tunnels
            .values()
            .filter_map(|e| {
                let age = e.closed_at?.elapsed();
                let limit = if e.is_drained() { retention } else { retention * 4 };
                (age >= limit).then(|| e.tunnel_id.clone())
            })
            .collect();
        for id in &expired {
            inner.remove(id);
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Swept closed tunnels");
        }
        expired
    }

    pub fn dropped_inbound(&self) -> u64 {
        self.dropped_inbound.load(Ordering::Relaxed)
    }
}

fn validate_target(target: &str) -> Result<(), TunnelError> {
    let ok = target
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok_and(|p| p != 0));
    if ok {
        Ok(())
    } else {
        Err(TunnelError::InvalidTarget(target.to_string()))
    }
}
