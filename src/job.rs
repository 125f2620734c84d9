//! Running one host's deployment.
//!
//! A `Job` is a host bound to a mode and a deadline. `execute` spawns the action for it, captures
//! both output streams, enforces the deadline and classifies what happened. The spawned process is
//! always reaped before `execute` returns, including on timeout.

use std::fmt;
use std::io::Write;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use colored::ColoredString;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Mutex;

use crate::action::Action;
use crate::config::Mode;
use crate::host::Host;

/// Captured output beyond this many bytes per stream is dropped.
const MAX_CAPTURE: usize = 1 << 20;
/// How long to keep draining both pipes after the process exited.
/// A backgrounded grandchild can hold them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Bytes read from one output stream so far. Survives the reader being aborted.
type Captured = Arc<Mutex<Vec<u8>>>;

#[derive(Debug, Clone)]
pub struct Job {
    pub host: Host,
    pub mode: Mode,
    /// Deadline for the action, measured from spawn.
    pub timeout: Duration,
    /// Colored `[host]` tag for console lines.
    pub tag: ColoredString,
    /// Echo output lines as they arrive.
    pub stream: bool,
}

impl Job {
    pub fn new(host: Host, mode: Mode, timeout: Duration) -> Self {
        let tag = ColoredString::from(host.to_string().as_str());
        Self {
            host,
            mode,
            timeout,
            tag,
            stream: false,
        }
    }

    pub fn with_tag(mut self, tag: ColoredString) -> Self {
        self.tag = tag;
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The action ran and exited zero.
    Succeeded,
    /// The action ran and exited nonzero.
    Failed,
    /// The action was killed at its deadline.
    TimedOut,
    /// The action could not be started.
    DispatchError,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Outcome::Succeeded => "succeeded",
            Outcome::Failed => "failed",
            Outcome::TimedOut => "timed_out",
            Outcome::DispatchError => "dispatch_error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct DeploymentResult {
    pub host: Host,
    pub outcome: Outcome,
    pub success: bool,
    pub duration: Duration,
    /// Exit code of the action, if it exited on its own.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl DeploymentResult {
    fn new(host: Host, outcome: Outcome, duration: Duration) -> Self {
        Self {
            host,
            outcome,
            success: outcome == Outcome::Succeeded,
            duration,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub(crate) fn dispatch_error(host: Host, duration: Duration, error: String) -> Self {
        let mut result = Self::new(host, Outcome::DispatchError, duration);
        result.stderr = error;
        result
    }

    /// First non-blank line of stderr, for one-line failure summaries.
    pub fn first_error_line(&self) -> Option<&str> {
        self.stderr.lines().map(str::trim).find(|l| !l.is_empty())
    }
}

/// Cuts `text` down to at most `max_chars` characters, marking the cut.
pub fn truncate_output(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}... [truncated]", &text[..idx]),
        None => text.to_string(),
    }
}

/// Runs `job` to completion or to its deadline. Never fails; every error is an `Outcome`.
pub async fn execute(action: &dyn Action, job: Job) -> DeploymentResult {
    let started = Instant::now();

    let mut cmd = match action.command(&job.host, job.mode) {
        Ok(cmd) => cmd,
        Err(e) => return DeploymentResult::dispatch_error(job.host, started.elapsed(), e.to_string()),
    };
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let error = format!("Failed to start deployment action: {}", e);
            return DeploymentResult::dispatch_error(job.host, started.elapsed(), error);
        }
    };
    tracing::debug!(host = %job.host.address, pid = ?child.id(), mode = %job.mode, "Spawned action");

    let echo = job.stream.then(|| job.tag.clone());
    let stdout = Captured::default();
    let stderr = Captured::default();
    let mut stdout_task = tokio::spawn(capture(child.stdout.take(), echo.clone(), stdout.clone()));
    let mut stderr_task = tokio::spawn(capture(child.stderr.take(), echo, stderr.clone()));

    match tokio::time::timeout(job.timeout, child.wait()).await {
        Ok(Ok(status)) => {
            let duration = started.elapsed();
            let outcome = if status.success() {
                Outcome::Succeeded
            } else {
                Outcome::Failed
            };
            let mut result = DeploymentResult::new(job.host, outcome, duration);
            result.exit_code = status.code();
            let drained = tokio::time::timeout(DRAIN_GRACE, async {
                let _ = tokio::join!(&mut stdout_task, &mut stderr_task);
            })
            .await;
            if drained.is_err() {
                tracing::debug!(host = %result.host.address, "Output pipes still open after exit");
                stdout_task.abort();
                stderr_task.abort();
            }
            result.stdout = decode(&stdout).await;
            result.stderr = decode(&stderr).await;
            if outcome == Outcome::Failed && result.stderr.trim().is_empty() {
                result.stderr = format!("Deployment action exited with {}", status);
            }
            result
        }
        Ok(Err(e)) => {
            // Reap whatever is left; the wait itself is what failed.
            let _ = child.kill().await;
            stdout_task.abort();
            stderr_task.abort();
            let error = format!("Failed to wait for deployment action: {}", e);
            DeploymentResult::dispatch_error(job.host, started.elapsed(), error)
        }
        Err(_) => {
            if let Err(e) = child.kill().await {
                tracing::warn!(host = %job.host.address, error = %e, "Failed to kill timed out action");
            }
            stdout_task.abort();
            stderr_task.abort();
            let mut result = DeploymentResult::new(job.host, Outcome::TimedOut, job.timeout);
            result.stderr = format!("Timed out after {}s", job.timeout.as_secs_f64());
            result
        }
    }
}

async fn decode(captured: &Captured) -> String {
    String::from_utf8_lossy(&captured.lock().await).into_owned()
}

/// Reads a stream to EOF into `captured`, optionally echoing each line prefixed with `echo`.
async fn capture<B: AsyncRead + Unpin>(
    stream: Option<B>,
    echo: Option<ColoredString>,
    captured: Captured,
) {
    let Some(stream) = stream else {
        return;
    };
    let mut reader = BufReader::new(stream);
    let mut line = Vec::with_capacity(reader.buffer().len());
    loop {
        line.clear();
        match read_until2(&mut reader, b'\r', b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "Stopped reading action output");
                break;
            }
        }
        if let Some(tag) = &echo {
            print_line(tag, &line);
        }
        let mut captured = captured.lock().await;
        let room = MAX_CAPTURE.saturating_sub(captured.len());
        captured.extend_from_slice(&line[..line.len().min(room)]);
    }
}

fn print_line(tag: &ColoredString, line: &[u8]) {
    let text = String::from_utf8_lossy(line);
    let text = text.trim_end_matches(['\r', '\n']);
    if text.is_empty() {
        return;
    }
    // Without the lock, lines from different hosts get mixed.
    let stdout = std::io::stdout();
    let mut guard = stdout.lock();
    let _ = writeln!(guard, "{} {}", tag, text);
}

/// Reads into `buf` until either delimiter is met (inclusive) or EOF.
/// Returns the number of bytes consumed; zero means EOF.
async fn read_until2<B: AsyncRead + Unpin>(
    reader: &mut BufReader<B>,
    delimiter1: u8,
    delimiter2: u8,
    buf: &mut Vec<u8>,
) -> std::io::Result<usize> {
    let mut total = 0;
    loop {
        let (done, used) = {
            let available = reader.fill_buf().await?;
            if let Some(i) = memchr::memchr2(delimiter1, delimiter2, available) {
                buf.extend_from_slice(&available[..=i]);
                (true, i + 1)
            } else {
                buf.extend_from_slice(available);
                (false, available.len())
            }
        };
        reader.consume(used);
        total += used;
        if done || used == 0 {
            return Ok(total);
        }
    }
}
