//! `shell`: run one command line through the configured shell.
//!
//! Output is returned as raw bytes. The server decides how to decode it, so
//! legacy code-page output from `cmd.exe` survives the trip untouched.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

use super::{ExecContext, ExecError, Executor};

pub struct ShellExecutor;

#[async_trait]
impl Executor for ShellExecutor {
    async fn execute(
        &self,
        ctx: &ExecContext,
        _task_id: &str,
        args: &[u8],
    ) -> Result<Vec<u8>, ExecError> {
        let command = String::from_utf8_lossy(args);
        if command.trim().is_empty() {
            return Err(ExecError::InvalidArguments("empty command".into()));
        }
        let result = exec_command(
            &ctx.config.shell,
            &command,
            Duration::from_millis(ctx.config.timeout_ms),
            ctx.config.max_output_bytes,
        )
        .await?;
        debug!(
            exit_code = result.exit_code,
            duration_ms = result.duration_ms,
            "Shell command finished"
        );

        let mut out = result.stdout;
        out.extend_from_slice(&result.stderr);
        if result.exit_code != 0 {
            out.extend_from_slice(format!("\n[exit code {}]", result.exit_code).as_bytes());
        }
        Ok(out)
    }
}

/// Captured output of [`exec_command`].
#[derive(Debug)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration_ms: u64,
}

/// `cmd` takes `/C`, every POSIX shell takes `-c`.
fn command_flag(shell: &str) -> &'static str {
    let base = shell.rsplit(['/', '\\']).next().unwrap_or(shell).to_ascii_lowercase();
    if base == "cmd" || base == "cmd.exe" {
        "/C"
    } else {
        "-c"
    }
}

/// Run `<shell> -c "<command>"` with stdin closed, capturing both streams.
///
/// Stdout and stderr are read concurrently and each capped at `max_output`
/// bytes. The whole run is bounded by `timeout`; the child is killed when the
/// future is dropped.
pub async fn exec_command(
    shell: &str,
    command: &str,
    timeout: Duration,
    max_output: usize,
) -> Result<ExecResult, ExecError> {
    let start = Instant::now();

    let mut child = Command::new(shell)
        .arg(command_flag(shell))
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ExecError::SpawnFailed(e.to_string()))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| ExecError::ProcessFailed("stdout pipe missing".into()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| ExecError::ProcessFailed("stderr pipe missing".into()))?;

    let run = async {
        let (stdout_data, stderr_data) = tokio::join!(
            read_capped(&mut stdout, max_output),
            read_capped(&mut stderr, max_output),
        );
        drop(stdout);
        drop(stderr);

        let status = child
            .wait()
            .await
            .map_err(|e| ExecError::ProcessFailed(e.to_string()))?;

        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = start.elapsed().as_millis() as u64;
        Ok::<_, ExecError>(ExecResult {
            exit_code: status.code().unwrap_or(-1),
            stdout: stdout_data,
            stderr: stderr_data,
            duration_ms,
        })
    };

    match tokio::time::timeout(timeout, run).await {
        Ok(result) => result,
        Err(_) => Err(ExecError::Timeout(timeout)),
    }
}

/// Keep the first `max_bytes`, drain and discard the rest so the child never
/// blocks on a full pipe.
async fn read_capped(reader: &mut (impl tokio::io::AsyncRead + Unpin), max_bytes: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(max_bytes.min(65536));
    let mut tmp = [0u8; 8192];
    let mut total_read = 0usize;

    loop {
        match reader.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                total_read += n;
                if buf.len() < max_bytes {
                    let take = n.min(max_bytes - buf.len());
                    buf.extend_from_slice(&tmp[..take]);
                }
            }
        }
    }

    if total_read > max_bytes {
        buf.extend_from_slice(
            format!("\n[truncated: {total_read} bytes total, kept first {max_bytes}]").as_bytes(),
        );
    }
    buf
}
