//! Beacon-side command handlers.
//!
//! | Module | Commands |
//! |--------|----------|
//! | [`shell`] | `shell` |
//! | [`files`] | `download`, `upload` |
//! | [`control`] | `sleep`, `exit` |
//!
//! Every handler runs on its own tokio task through [`run_task`], so a panic
//! inside one becomes a failed [`TaskResult`] instead of taking the beacon
//! down.

pub mod control;
pub mod files;
pub mod shell;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use skiff::commands::{CommandDescriptor, CommandRegistry, RegistryError};
use skiff::protocol::{BuiltinCommand, TaskEnvelope, TaskResult};

use crate::client::ChunkSource;
use crate::config::ExecConfig;
use crate::sleep::SleepCell;
use crate::transfer::FetchError;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("failed to spawn: {0}")]
    SpawnFailed(String),
    #[error("process failed: {0}")]
    ProcessFailed(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("{path}: file is {size} bytes, limit is {max}")]
    TooLarge { path: String, size: u64, max: u64 },
    #[error("{path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("download failed: {0}")]
    Download(#[from] FetchError),
}

/// Everything a handler may touch besides its arguments.
pub struct ExecContext {
    pub config: ExecConfig,
    pub sleep: Arc<SleepCell>,
    pub chunks: Arc<dyn ChunkSource>,
    /// Cancelled once an `exit` task has run.
    pub exit: CancellationToken,
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        ctx: &ExecContext,
        task_id: &str,
        args: &[u8],
    ) -> Result<Vec<u8>, ExecError>;
}

pub type BeaconRegistry = CommandRegistry<Arc<dyn Executor>>;

/// Registry with a handler for every built-in command.
pub fn builtin_registry() -> Result<BeaconRegistry, RegistryError> {
    let mut reg = BeaconRegistry::new();
    for cmd in BuiltinCommand::ALL {
        let handler: Arc<dyn Executor> = match cmd {
            BuiltinCommand::Shell => Arc::new(shell::ShellExecutor),
            BuiltinCommand::Download => Arc::new(files::DownloadExecutor),
            BuiltinCommand::Upload => Arc::new(files::UploadExecutor),
            BuiltinCommand::Sleep => Arc::new(control::SleepExecutor),
            BuiltinCommand::Exit => Arc::new(control::ExitExecutor),
        };
        reg.try_register(CommandDescriptor::new(cmd.id(), cmd.name(), handler))?;
    }
    Ok(reg)
}

/// Run one envelope to completion and turn the outcome into a result.
pub async fn run_task(
    registry: Arc<BeaconRegistry>,
    ctx: Arc<ExecContext>,
    envelope: TaskEnvelope,
) -> TaskResult {
    let TaskEnvelope {
        task_id,
        command_id,
        arguments,
    } = envelope;

    let Some(descriptor) = registry.resolve_id(command_id) else {
        warn!(task_id = %task_id, command_id, "Unknown command id");
        return TaskResult::failed(task_id, format!("unknown command id {command_id}"));
    };
    debug!(task_id = %task_id, command = %descriptor.name, "Executing task");

    let handler = descriptor.handler.clone();
    let id = task_id.clone();
    let joined = tokio::spawn(async move { handler.execute(&ctx, &id, &arguments).await }).await;

    match joined {
        Ok(Ok(output)) => TaskResult::ok(task_id, output),
        Ok(Err(e)) => {
            warn!(task_id = %task_id, command = %descriptor.name, error = %e, "Task failed");
            TaskResult::failed(task_id, e.to_string())
        }
        Err(e) if e.is_panic() => {
            warn!(task_id = %task_id, command = %descriptor.name, "Handler panicked");
            TaskResult::failed(task_id, format!("{} handler panicked", descriptor.name))
        }
        Err(e) => TaskResult::failed(task_id, format!("handler aborted: {e}")),
    }
}
