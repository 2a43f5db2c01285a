//! Beacon side of the tunnel relay.
//!
//! Each tunnel is one TCP connection to a target the server named in a START
//! message. Two workers serve it:
//!
//! - **reader**: reads the socket with a short deadline so it notices
//!   cancellation, and emits a DATA message per read. EOF becomes a DATA with
//!   `is_fin`; a read error becomes a failure STOP.
//! - **writer**: drains a small per-tunnel queue of server data into the
//!   socket. A server fin half-closes the write side.
//!
//! Everything the workers produce goes into one process-wide outbound queue
//! that the poll loop drains into the next check-in. Workers never block on
//! it for long: when it stays full past the enqueue timeout the message is
//! dropped and counted.
//!
//! ```text
//! Starting ──dial ok──▶ Active ──stop/eof/error──▶ Closing ──▶ Closed
//!     └──────dial failed / STOP───────────────────────▲
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use skiff::protocol::{TunnelCommand, TunnelMessage};

use crate::config::TunnelConfig;

const READ_BUF_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Starting = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl Phase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Phase::Starting,
            1 => Phase::Active,
            2 => Phase::Closing,
            _ => Phase::Closed,
        }
    }
}

enum Inbound {
    Data(Vec<u8>),
    Fin,
}

struct Handle {
    phase: Arc<AtomicU8>,
    inbound: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
}

struct Inner {
    config: TunnelConfig,
    tunnels: Mutex<HashMap<String, Handle>>,
    outbound_tx: mpsc::Sender<TunnelMessage>,
    outbound_rx: Mutex<mpsc::Receiver<TunnelMessage>>,
    dropped: AtomicU64,
}

/// All live tunnels of this beacon. Cheap to clone.
#[derive(Clone)]
pub struct TunnelManager {
    inner: Arc<Inner>,
}

impl TunnelManager {
    pub fn new(config: TunnelConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_depth.max(1));
        Self {
            inner: Arc::new(Inner {
                config,
                tunnels: Mutex::new(HashMap::new()),
                outbound_tx,
                outbound_rx: Mutex::new(outbound_rx),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Apply one message received from the server.
    pub async fn handle(&self, msg: TunnelMessage) {
        let msg = msg.normalized();
        match msg.command {
            TunnelCommand::Start => match msg.target.as_deref() {
                Some(target) => self.open(&msg.tunnel_id, target).await,
                None => {
                    self.emit(TunnelMessage::start_ack(
                        &msg.tunnel_id,
                        Some("START without target".into()),
                    ))
                    .await;
                }
            },
            TunnelCommand::Data => self.forward(msg).await,
            TunnelCommand::Stop => {
                debug!(tunnel_id = %msg.tunnel_id, "Server stopped tunnel");
                self.teardown(&msg.tunnel_id).await;
            }
        }
    }

    async fn open(&self, tunnel_id: &str, target: &str) {
        let (inbound_tx, inbound_rx) = mpsc::channel(self.inner.config.inbound_depth.max(1));
        let phase = Arc::new(AtomicU8::new(Phase::Starting as u8));
        let cancel = CancellationToken::new();
        {
            let mut tunnels = self.inner.tunnels.lock().await;
            if tunnels.contains_key(tunnel_id) {
                debug!(tunnel_id, "Duplicate START ignored");
                return;
            }
            tunnels.insert(
                tunnel_id.to_string(),
                Handle {
                    phase: phase.clone(),
                    inbound: inbound_tx,
                    cancel: cancel.clone(),
                },
            );
        }

        let mgr = self.clone();
        let id = tunnel_id.to_string();
        let target = target.to_string();
        tokio::spawn(async move {
            mgr.dial_and_run(id, target, inbound_rx, phase, cancel).await;
        });
    }

    async fn dial_and_run(
        &self,
        id: String,
        target: String,
        inbound_rx: mpsc::Receiver<Inbound>,
        phase: Arc<AtomicU8>,
        cancel: CancellationToken,
    ) {
        let dial = tokio::time::timeout(self.inner.config.dial_timeout(), TcpStream::connect(&target));
        let stream = tokio::select! {
            () = cancel.cancelled() => {
                debug!(tunnel_id = %id, "Tunnel stopped while dialing");
                return;
            }
            r = dial => r,
        };
        let stream = match stream {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                warn!(tunnel_id = %id, %target, error = %e, "Tunnel dial failed");
                self.emit(TunnelMessage::start_ack(&id, Some(format!("dial {target}: {e}"))))
                    .await;
                self.teardown(&id).await;
                return;
            }
            Err(_) => {
                warn!(tunnel_id = %id, %target, "Tunnel dial timed out");
                self.emit(TunnelMessage::start_ack(&id, Some(format!("dial {target}: timed out"))))
                    .await;
                self.teardown(&id).await;
                return;
            }
        };

        let _ = stream.set_nodelay(true);
        phase.store(Phase::Active as u8, Ordering::Release);
        info!(tunnel_id = %id, %target, "Tunnel connected");
        self.emit(TunnelMessage::start_ack(&id, None)).await;

        let (read_half, write_half) = stream.into_split();
        let reader = {
            let mgr = self.clone();
            let id = id.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { mgr.read_loop(id, read_half, cancel).await })
        };
        self.write_loop(&id, write_half, inbound_rx, &cancel).await;
        let _ = reader.await;
        debug!(tunnel_id = %id, "Tunnel workers finished");
    }

    async fn read_loop(&self, id: String, mut reader: OwnedReadHalf, cancel: CancellationToken) {
        let read_timeout = self.inner.config.read_timeout();
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            let read = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                r = tokio::time::timeout(read_timeout, reader.read(&mut buf)) => r,
            };
            match read {
                // Deadline passed with nothing to read; loop to re-check cancellation.
                Err(_) => continue,
                Ok(Ok(0)) => {
                    debug!(tunnel_id = %id, "Target closed connection");
                    self.emit(TunnelMessage::data(&id, Vec::new(), true)).await;
                    self.teardown(&id).await;
                    break;
                }
                Ok(Ok(n)) => {
                    self.emit(TunnelMessage::data(&id, buf[..n].to_vec(), false))
                        .await;
                }
                Ok(Err(e)) => {
                    warn!(tunnel_id = %id, error = %e, "Tunnel read failed");
                    self.emit(TunnelMessage::failure(&id, format!("read: {e}"))).await;
                    self.teardown(&id).await;
                    break;
                }
            }
        }
    }

    async fn write_loop(
        &self,
        id: &str,
        mut writer: OwnedWriteHalf,
        mut inbound: mpsc::Receiver<Inbound>,
        cancel: &CancellationToken,
    ) {
        let write_timeout = self.inner.config.write_timeout();
        loop {
            // Queued data goes out before a cancellation is honoured.
            let next = tokio::select! {
                biased;
                m = inbound.recv() => m,
                () = cancel.cancelled() => None,
            };
            match next {
                Some(Inbound::Data(bytes)) => {
                    match tokio::time::timeout(write_timeout, writer.write_all(&bytes)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            warn!(tunnel_id = id, error = %e, "Tunnel write failed");
                            self.emit(TunnelMessage::failure(id, format!("write: {e}"))).await;
                            self.teardown(id).await;
                            return;
                        }
                        Err(_) => {
                            warn!(tunnel_id = id, "Tunnel write timed out");
                            self.emit(TunnelMessage::failure(id, "write: timed out")).await;
                            self.teardown(id).await;
                            return;
                        }
                    }
                }
                Some(Inbound::Fin) => {
                    debug!(tunnel_id = id, "Half-closing target");
                    let _ = writer.shutdown().await;
                    return;
                }
                None => return,
            }
        }
    }

    /// Route server data into the tunnel's writer queue.
    async fn forward(&self, msg: TunnelMessage) {
        let sender = {
            let tunnels = self.inner.tunnels.lock().await;
            tunnels.get(&msg.tunnel_id).map(|h| h.inbound.clone())
        };
        let Some(sender) = sender else {
            debug!(tunnel_id = %msg.tunnel_id, "DATA for unknown tunnel");
            self.emit(TunnelMessage::failure(&msg.tunnel_id, "unknown tunnel"))
                .await;
            return;
        };

        let timeout = self.inner.config.write_timeout();
        let mut items = Vec::with_capacity(2);
        if !msg.data.is_empty() {
            items.push(Inbound::Data(msg.data));
        }
        if msg.is_fin {
            items.push(Inbound::Fin);
        }
        for item in items {
            if sender.send_timeout(item, timeout).await.is_err() {
                warn!(tunnel_id = %msg.tunnel_id, "Tunnel writer backed up");
                self.emit(TunnelMessage::failure(&msg.tunnel_id, "writer queue full"))
                    .await;
                self.teardown(&msg.tunnel_id).await;
                return;
            }
        }
    }

    /// Queue a message for the next check-in, dropping it if the queue stays
    /// full past the enqueue timeout.
    async fn emit(&self, msg: TunnelMessage) {
        let timeout = self.inner.config.enqueue_timeout();
        match self.inner.outbound_tx.send_timeout(msg, timeout).await {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(msg)) => {
                let total = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    tunnel_id = %msg.tunnel_id,
                    dropped_total = total,
                    "Outbound tunnel queue full, message dropped"
                );
            }
            Err(SendTimeoutError::Closed(_)) => {}
        }
    }

    /// Stop a tunnel and release its socket. Safe to call more than once.
    pub async fn teardown(&self, tunnel_id: &str) {
        let Some(handle) = self.inner.tunnels.lock().await.remove(tunnel_id) else {
            return;
        };
        handle.phase.store(Phase::Closing as u8, Ordering::Release);
        handle.cancel.cancel();
        handle.phase.store(Phase::Closed as u8, Ordering::Release);
        debug!(tunnel_id, "Tunnel torn down");
    }

    /// Tear down every tunnel.
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.inner.tunnels.lock().await.keys().cloned().collect();
        for id in ids {
            self.teardown(&id).await;
        }
    }

    /// Everything queued for the server since the last call.
    pub async fn drain_outbound(&self) -> Vec<TunnelMessage> {
        let mut rx = self.inner.outbound_rx.lock().await;
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    /// Put messages back at the tail after a failed check-in.
    pub async fn requeue(&self, messages: Vec<TunnelMessage>) {
        for msg in messages {
            self.emit(msg).await;
        }
    }

    /// Phase of a live tunnel; `None` once it has been torn down.
    pub async fn phase(&self, tunnel_id: &str) -> Option<Phase> {
        self.inner
            .tunnels
            .lock()
            .await
            .get(tunnel_id)
            .map(|h| Phase::from_u8(h.phase.load(Ordering::Acquire)))
    }

    pub async fn active_count(&self) -> usize {
        self.inner.tunnels.lock().await.len()
    }

    /// Outbound messages dropped because the queue stayed full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn config() -> TunnelConfig {
        TunnelConfig {
            dial_timeout_ms: 1000,
            read_timeout_ms: 50,
            ..TunnelConfig::default()
        }
    }

    /// Echo server on loopback. Returns its address.
    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = sock.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    /// Drain until `pred` matches or a second passes.
    async fn wait_for(
        mgr: &TunnelManager,
        pred: impl Fn(&TunnelMessage) -> bool,
    ) -> (TunnelMessage, Vec<TunnelMessage>) {
        let mut seen = Vec::new();
        for _ in 0..100 {
            for msg in mgr.drain_outbound().await {
                if pred(&msg) {
                    return (msg, seen);
                }
                seen.push(msg);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no matching message; saw {seen:?}");
    }

    #[tokio::test]
    async fn echo_round_trip() {
        let addr = echo_server().await;
        let mgr = TunnelManager::new(config());

        mgr.handle(TunnelMessage::start("t1", &addr)).await;
        let (ack, _) = wait_for(&mgr, |m| m.command == TunnelCommand::Start).await;
        assert!(!ack.is_error);
        assert_eq!(mgr.phase("t1").await, Some(Phase::Active));

        mgr.handle(TunnelMessage::data("t1", b"ping".to_vec(), false)).await;
        let (data, _) = wait_for(&mgr, |m| m.command == TunnelCommand::Data).await;
        assert_eq!(data.tunnel_id, "t1");
        assert_eq!(data.data, b"ping");

        mgr.handle(TunnelMessage::stop("t1")).await;
        assert_eq!(mgr.phase("t1").await, None);
        assert_eq!(mgr.active_count().await, 0);
    }

    #[tokio::test]
    async fn refused_dial_is_acked_with_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mgr = TunnelManager::new(config());
        mgr.handle(TunnelMessage::start("t2", &addr)).await;
        let (ack, _) = wait_for(&mgr, |m| m.command == TunnelCommand::Start).await;
        assert!(ack.is_error);
        assert!(ack.error.unwrap().starts_with("dial"));
        assert_eq!(mgr.phase("t2").await, None);
    }

    #[tokio::test]
    async fn server_fin_half_closes_and_target_eof_finishes() {
        let addr = echo_server().await;
        let mgr = TunnelManager::new(config());
        mgr.handle(TunnelMessage::start("t3", &addr)).await;
        wait_for(&mgr, |m| m.command == TunnelCommand::Start).await;

        // Echo copies "bye", sees our half-close, then closes its side.
        mgr.handle(TunnelMessage::data("t3", b"bye".to_vec(), true)).await;
        let (fin, before) = wait_for(&mgr, |m| m.is_fin).await;
        assert_eq!(fin.command, TunnelCommand::Data);
        assert!(fin.data.is_empty());
        let echoed: Vec<u8> = before.iter().flat_map(|m| m.data.clone()).collect();
        assert_eq!(echoed, b"bye");

        for _ in 0..50 {
            if mgr.phase("t3").await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(mgr.phase("t3").await, None);
    }

    #[tokio::test]
    async fn data_for_unknown_tunnel_reports_failure() {
        let mgr = TunnelManager::new(config());
        mgr.handle(TunnelMessage::data("ghost", b"x".to_vec(), false)).await;
        let out = mgr.drain_outbound().await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].command, TunnelCommand::Stop);
        assert!(out[0].is_error);
    }

    #[tokio::test]
    async fn full_outbound_queue_drops_and_counts() {
        let mgr = TunnelManager::new(TunnelConfig {
            outbound_depth: 1,
            enqueue_timeout_ms: 10,
            ..config()
        });
        mgr.emit(TunnelMessage::stop("a")).await;
        mgr.emit(TunnelMessage::stop("b")).await;
        assert_eq!(mgr.dropped(), 1);
        let out = mgr.drain_outbound().await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].tunnel_id, "a");
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let addr = echo_server().await;
        let mgr = TunnelManager::new(config());
        mgr.handle(TunnelMessage::start("t4", &addr)).await;
        wait_for(&mgr, |m| m.command == TunnelCommand::Start).await;
        mgr.teardown("t4").await;
        mgr.teardown("t4").await;
        mgr.shutdown_all().await;
        assert_eq!(mgr.active_count().await, 0);
        assert!(mgr.drain_outbound().await.is_empty());
    }
}
