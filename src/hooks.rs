//! Hook subprocess execution.
//!
//! A hook is an external program run immediately before or after a snapshot.
//! Its stdout is forwarded line-by-line to the log at info level, stderr at
//! warn level, and the whole invocation is bounded by a deadline; on expiry
//! the process is killed. Relative commands resolve against the daemon's
//! hook directory, never `$PATH`.

use crate::error::HookError;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Runs `command` to completion with `env` appended to the daemon's own
/// environment. Returns an error if the process fails to start, exits
/// non-zero, is killed by the deadline, or is aborted by `cancel`.
pub async fn run_hook(
    command: &str,
    hook_dir: &Path,
    env: &[(String, String)],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), HookError> {
    let cmd_path = if Path::new(command).is_absolute() {
        PathBuf::from(command)
    } else {
        hook_dir.join(command)
    };
    let display = cmd_path.display().to_string();

    let mut cmd = Command::new(&cmd_path);
    for (k, v) in env {
        cmd.env(k, v);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(HookError::Start)?;

    let out_task = child
        .stdout
        .take()
        .map(|out| spawn_line_logger(out, display.clone(), LogLevel::Info));
    let err_task = child
        .stderr
        .take()
        .map(|err| spawn_line_logger(err, display.clone(), LogLevel::Warn));

    let result = tokio::select! {
        res = tokio::time::timeout(timeout, child.wait()) => match res {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(HookError::Failed { status }),
            Ok(Err(source)) => Err(HookError::Wait(source)),
            Err(_elapsed) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(HookError::Timeout { timeout })
            }
        },
        () = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err(HookError::Cancelled)
        }
    };

    // The pipes are closed now; join the readers so every line, including a
    // trailing partial one, has been emitted before we report the outcome.
    if let Some(task) = out_task {
        let _ = task.await;
    }
    if let Some(task) = err_task {
        let _ = task.await;
    }

    result
}

enum LogLevel {
    Info,
    Warn,
}

/// Reads one stream to end-of-pipe, emitting each completed line as exactly
/// one log event. `lines()` yields the final unterminated line as well, which
/// covers the flush-on-close requirement.
fn spawn_line_logger(
    stream: impl AsyncRead + Unpin + Send + 'static,
    hook: String,
    level: LogLevel,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match level {
                LogLevel::Info => tracing::info!(hook = %hook, "{}", line),
                LogLevel::Warn => tracing::warn!(hook = %hook, "{}", line),
            }
        }
    })
}
