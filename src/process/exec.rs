//! Bounded one-shot execution with output capture.
//!
//! Every helper invocation (launcher scripts, elevated `kill`/`rm`) goes
//! through [`run`]. The child has `kill_on_drop(true)`, so a timeout also
//! kills it when the future is dropped.

use std::ffi::OsStr;
use std::fmt::Write;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::error::TunnelError;

/// Max output size per stream for [`run`] (256 KB).
///
/// Output beyond this limit is still drained from the pipe (to prevent
/// deadlocks) but discarded. A truncation notice is appended to the returned
/// string.
const MAX_EXEC_OUTPUT: usize = 256 * 1024;

/// Run `program args...` to completion, capturing stdout and stderr.
///
/// Stdout and stderr are read concurrently (to avoid pipe deadlock) and each
/// capped at [`MAX_EXEC_OUTPUT`] bytes. The entire operation is wrapped in a
/// `tokio::time::timeout`.
pub async fn run<S: AsRef<OsStr>>(
    program: impl AsRef<OsStr>,
    args: &[S],
    timeout: Duration,
) -> Result<ExecResult, ExecError> {
    let start = Instant::now();

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd
        .spawn()
        .map_err(|e| ExecError::SpawnFailed(e.to_string()))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| ExecError::ProcessFailed("Failed to take stdout pipe".to_string()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| ExecError::ProcessFailed("Failed to take stderr pipe".to_string()))?;

    match Box::pin(tokio::time::timeout(timeout, async {
        let (stdout_data, stderr_data) = tokio::join!(
            read_capped(&mut stdout, MAX_EXEC_OUTPUT),
            read_capped(&mut stderr, MAX_EXEC_OUTPUT),
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
    }))
    .await
    {
        Ok(result) => result,
        Err(_) => Err(ExecError::Timeout(timeout)),
    }
}

/// Run `program args...` through the elevation prefix (e.g. `sudo -n`).
///
/// With an empty prefix the command runs unelevated.
pub async fn run_elevated(
    prefix: &[String],
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<ExecResult, ExecError> {
    let Some((elevator, elevator_args)) = prefix.split_first() else {
        return run(program, args, timeout).await;
    };
    let mut full: Vec<String> = elevator_args.to_vec();
    full.push(program.to_string());
    full.extend(args.iter().cloned());
    run(elevator, &full, timeout).await
}

/// Read from an async reader, keeping the first `max_bytes` and discarding the
/// rest.
///
/// Continues reading past the cap instead of closing the pipe early: closing
/// a pipe while the child is still writing causes SIGPIPE in the child.
async fn read_capped(reader: &mut (impl tokio::io::AsyncRead + Unpin), max_bytes: usize) -> String {
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
    let mut s = String::from_utf8_lossy(&buf).into_owned();
    if total_read > max_bytes {
        let _ = write!(
            s,
            "\n[truncated: {total_read} bytes total, showing first {max_bytes}]"
        );
    }
    s
}

/// Successful result of [`run`].
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Process exit code, or `-1` if the code was unavailable (e.g. killed by signal).
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Wall-clock duration of the command in milliseconds.
    pub duration_ms: u64,
}

impl ExecResult {
    /// Stdout and stderr joined, trimmed, for surfacing to the user.
    pub fn combined_output(&self) -> String {
        let out = self.stdout.trim();
        let err = self.stderr.trim();
        match (out.is_empty(), err.is_empty()) {
            (true, true) => String::new(),
            (false, true) => out.to_string(),
            (true, false) => err.to_string(),
            (false, false) => format!("{out}\n{err}"),
        }
    }
}

/// Errors that can occur during [`run`].
#[derive(Debug)]
pub enum ExecError {
    /// The binary could not be started (e.g. not found, permission denied).
    SpawnFailed(String),
    /// The child process started but `wait()` failed.
    ProcessFailed(String),
    /// The command exceeded its timeout and was killed.
    Timeout(Duration),
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecError::SpawnFailed(e) => write!(f, "Failed to spawn process: {e}"),
            ExecError::ProcessFailed(e) => write!(f, "Process error: {e}"),
            ExecError::Timeout(t) => write!(f, "Command timed out after {}s", t.as_secs()),
        }
    }
}

impl From<ExecError> for TunnelError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::Timeout(_) => TunnelError::Timeout(err.to_string()),
            ExecError::SpawnFailed(_) | ExecError::ProcessFailed(_) => {
                TunnelError::Process(err.to_string())
            }
        }
    }
}
