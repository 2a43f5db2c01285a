//! `sleep` and `exit`: tasks that steer the beacon itself.

use async_trait::async_trait;
use tracing::info;

use skiff::commands::parse_sleep_args;

use super::{ExecContext, ExecError, Executor};

/// `"<secs> [jitter_pct]"`: replaces the poll interval atomically.
pub struct SleepExecutor;

#[async_trait]
impl Executor for SleepExecutor {
    async fn execute(
        &self,
        ctx: &ExecContext,
        _task_id: &str,
        args: &[u8],
    ) -> Result<Vec<u8>, ExecError> {
        let (secs, jitter) =
            parse_sleep_args(&String::from_utf8_lossy(args)).map_err(ExecError::InvalidArguments)?;
        let (secs, jitter) = ctx.sleep.set(secs, jitter);
        info!(secs, jitter, "Poll interval changed");
        Ok(format!("sleep set to {secs}s with {jitter}% jitter").into_bytes())
    }
}

/// Requests shutdown. The poll loop flushes pending results, then stops.
pub struct ExitExecutor;

#[async_trait]
impl Executor for ExitExecutor {
    async fn execute(
        &self,
        ctx: &ExecContext,
        task_id: &str,
        _args: &[u8],
    ) -> Result<Vec<u8>, ExecError> {
        info!(task_id, "Exit requested");
        ctx.exit.cancel();
        Ok(b"exiting".to_vec())
    }
}
