//! Subprocess execution for command-backed tools.
//!
//! [`run_tool_command`] spawns the child, pipes the JSON parameters to its
//! stdin and follows its stdout line by line. A line like
//! `{"progress": 40, "message": "Merging"}` is forwarded to the
//! [`ProgressSink`]; the last line carrying `{"result": {...}}` becomes the
//! job result. The child is killed when the deadline passes or when the kill
//! hook registered on the job's [`CancelToken`] fires.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use docjobs_core::{CancelToken, JobResult, ProgressSink, ToolError};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;

/// Maximum stderr captured per child (64 KiB).
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Stderr characters quoted in a non-zero exit error.
const STDERR_EXCERPT_CHARS: usize = 500;

/// What a successful child produced.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub result: Option<JobResult>,
    pub stderr: String,
    pub duration_ms: u64,
}

/// One structured stdout line. Unknown fields are ignored.
#[derive(Debug, Deserialize)]
struct StdoutLine {
    progress: Option<f64>,
    message: Option<String>,
    result: Option<JobResult>,
}

enum Step {
    Line(std::io::Result<Option<String>>),
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
    HookDropped,
    TimedOut,
}

/// Spawn `cmd`, feed it `input` on stdin and wait for it within `timeout`.
///
/// The caller sets the program and arguments; I/O pipes are configured here.
pub async fn run_tool_command(
    cmd: &mut Command,
    input: &serde_json::Value,
    timeout: Duration,
    progress: &dyn ProgressSink,
    cancel: &CancelToken,
) -> Result<CommandOutput, ToolError> {
    // `kill_on_drop` covers every early return below.
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    cancel.check()?;
    let start = Instant::now();
    let deadline = start + timeout;
    let mut child = cmd.spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        let payload = serde_json::to_vec(input)
            .map_err(|e| ToolError::InvalidParameters(e.to_string()))?;
        // The child may exit without reading stdin.
        let _ = stdin.write_all(&payload).await;
        drop(stdin);
    }

    let (kill_tx, mut kill_rx) = tokio::sync::oneshot::channel::<()>();
    cancel.on_cancel(move || {
        let _ = kill_tx.send(());
    });

    let stderr_task = tokio::spawn(read_capped(child.stderr.take()));
    let mut lines = child.stdout.take().map(|out| BufReader::new(out).lines());
    let mut result = None;
    let mut kill_armed = true;

    let status = loop {
        let step = tokio::select! {
            biased;
            hook = &mut kill_rx, if kill_armed => match hook {
                Ok(()) => Step::Cancelled,
                Err(_) => Step::HookDropped,
            },
            _ = tokio::time::sleep_until(deadline) => Step::TimedOut,
            line = next_line(&mut lines), if lines.is_some() => Step::Line(line),
            status = child.wait(), if lines.is_none() => Step::Exited(status),
        };

        match step {
            Step::Line(Ok(Some(line))) => {
                if let Some(found) = handle_line(&line, progress).await {
                    result = Some(found);
                }
            }
            Step::Line(Ok(None)) => lines = None,
            Step::Line(Err(e)) => {
                tracing::warn!(error = %e, "Failed to read tool stdout");
                lines = None;
            }
            Step::Exited(status) => break status?,
            Step::HookDropped => kill_armed = false,
            Step::Cancelled => {
                kill(&mut child).await;
                return Err(ToolError::Cancelled);
            }
            Step::TimedOut => {
                kill(&mut child).await;
                return Err(ToolError::Timeout {
                    elapsed_ms: elapsed_ms(start),
                });
            }
        }
    };

    let stderr_bytes = stderr_task.await.unwrap_or_default();
    let stderr = String::from_utf8_lossy(&stderr_bytes).into_owned();

    if !status.success() {
        let code = status
            .code()
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        let excerpt: String = stderr.trim().chars().take(STDERR_EXCERPT_CHARS).collect();
        return Err(ToolError::failed(
            "EXIT_STATUS",
            format!("Tool process exited with status {code}: {excerpt}"),
        ));
    }

    Ok(CommandOutput {
        result,
        stderr,
        duration_ms: elapsed_ms(start),
    })
}

async fn next_line<R>(lines: &mut Option<tokio::io::Lines<R>>) -> std::io::Result<Option<String>>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_line().await,
        None => Ok(None),
    }
}

/// Forward progress and return the result carried by `line`, if any.
async fn handle_line(line: &str, progress: &dyn ProgressSink) -> Option<JobResult> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        tracing::trace!(line = trimmed, "Tool output");
        return None;
    }
    let parsed: StdoutLine = match serde_json::from_str(trimmed) {
        Ok(parsed) => parsed,
        Err(_) => {
            tracing::trace!(line = trimmed, "Unstructured tool output");
            return None;
        }
    };

    if let Some(percent) = parsed.progress {
        let percent = percent.clamp(0.0, 100.0) as u8;
        progress
            .report(percent, parsed.message.as_deref().unwrap_or_default())
            .await;
    }
    parsed.result
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "Failed to kill tool process");
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Read a stream to EOF, keeping at most [`MAX_OUTPUT_BYTES`].
///
/// The pipe stays open past the cap so a chatty child never hits SIGPIPE.
async fn read_capped<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    let Some(mut h) = handle else {
        return buf;
    };
    let mut chunk = [0u8; 8192];
    loop {
        match h.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = MAX_OUTPUT_BYTES.saturating_sub(buf.len());
                buf.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    buf
}
