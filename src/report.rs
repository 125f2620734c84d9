//! Aggregating, rendering and persisting the results of a run.

use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use colored::*;
use serde::Serialize;

use crate::config::Mode;
use crate::error::FleetError;
use crate::host::Host;
use crate::job::{truncate_output, DeploymentResult, Outcome};
use crate::store::ResultStore;

/// Captured output kept per stream in a report entry.
pub const OUTPUT_PREVIEW_CHARS: usize = 2000;
/// Stderr lines shown under a failed host in the console summary.
const ERROR_LINES_SHOWN: usize = 2;
/// Exit code for a run that could not start, or whose results could not be saved.
pub const EXIT_FATAL: u8 = 2;

/// Overall result of a run. Decides the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FleetStatus {
    AllSucceeded,
    Partial,
    AllFailed,
}

impl FleetStatus {
    fn from_counts(succeeded: usize, failed: usize) -> Self {
        if failed == 0 {
            FleetStatus::AllSucceeded
        } else if succeeded == 0 {
            FleetStatus::AllFailed
        } else {
            FleetStatus::Partial
        }
    }

    pub fn exit_code(self) -> u8 {
        match self {
            FleetStatus::AllSucceeded => 0,
            FleetStatus::Partial => 1,
            FleetStatus::AllFailed => EXIT_FATAL,
        }
    }
}

/// Exit code of a finished run. Any failed write of a requested report file overrides `status`.
pub fn run_exit_code(status: FleetStatus, writes: &[Result<(), FleetError>]) -> u8 {
    if writes.iter().any(Result::is_err) {
        EXIT_FATAL
    } else {
        status.exit_code()
    }
}

/// One host's line in the report.
#[derive(Debug, Clone, Serialize)]
pub struct HostEntry {
    pub host: String,
    pub user: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub success: bool,
    pub outcome: Outcome,
    pub exit_code: Option<i32>,
    pub duration_secs: f64,
    pub stdout: String,
    pub stderr: String,
}

impl HostEntry {
    fn from_result(result: DeploymentResult) -> Self {
        Self {
            host: result.host.address,
            user: result.host.user,
            port: result.host.port,
            key: result.host.key.map(|k| k.display().to_string()),
            success: result.success,
            outcome: result.outcome,
            exit_code: result.exit_code,
            duration_secs: round_secs(result.duration),
            stdout: truncate_output(&result.stdout, OUTPUT_PREVIEW_CHARS),
            stderr: truncate_output(&result.stderr, OUTPUT_PREVIEW_CHARS),
        }
    }

    /// Rebuilds the host descriptor this entry was produced for.
    pub fn to_host(&self) -> Host {
        let host = Host::new(self.host.as_str())
            .with_user(self.user.as_str())
            .with_port(self.port);
        match &self.key {
            Some(key) => host.with_key(key),
            None => host,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetReport {
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    pub status: FleetStatus,
    pub total_hosts: usize,
    pub successful: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_secs: Option<f64>,
    /// Sorted by host.
    pub results: Vec<HostEntry>,
}

impl FleetReport {
    /// Builds a report from every result in `store`.
    pub async fn summarize(store: &ResultStore) -> Self {
        Self::from_results(store.results().await)
    }

    pub fn from_results(results: Vec<DeploymentResult>) -> Self {
        let mut entries: Vec<HostEntry> = results.into_iter().map(HostEntry::from_result).collect();
        entries.sort_by(|a, b| a.host.cmp(&b.host));

        let total_hosts = entries.len();
        let successful = entries
            .iter()
            .filter(|e| e.outcome == Outcome::Succeeded)
            .count();
        let failed = total_hosts - successful;

        Self {
            timestamp: Utc::now(),
            mode: None,
            status: FleetStatus::from_counts(successful, failed),
            total_hosts,
            successful,
            failed,
            elapsed_secs: None,
            results: entries,
        }
    }

    /// Attaches how the run was performed.
    pub fn with_run_info(mut self, mode: Mode, elapsed: Duration) -> Self {
        self.mode = Some(mode);
        self.elapsed_secs = Some(round_secs(elapsed));
        self
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.results.iter().filter(|e| e.outcome == outcome).count()
    }

    /// Entries that did not succeed, in report order.
    pub fn failed_hosts(&self) -> impl Iterator<Item = &HostEntry> {
        self.results.iter().filter(|e| !e.success)
    }
}

fn round_secs(duration: Duration) -> f64 {
    (duration.as_secs_f64() * 100.0).round() / 100.0
}

/// One console line for a host that just finished.
pub fn progress_line(tag: &ColoredString, result: &DeploymentResult) -> String {
    let secs = result.duration.as_secs_f64();
    match result.outcome {
        Outcome::Succeeded => format!("{} {} ({:.1}s)", tag, "✓ deployed".green(), secs),
        Outcome::Failed => {
            let exit = match result.exit_code {
                Some(code) => format!("exit {}", code),
                None => "killed by signal".to_string(),
            };
            let mut line = format!("{} {} ({}, {:.1}s)", tag, "✗ failed".red(), exit, secs);
            if let Some(error) = result.first_error_line() {
                let _ = write!(line, "\n{}   Error: {}", tag, error);
            }
            line
        }
        Outcome::TimedOut => format!("{} {} after {:.1}s", tag, "⏱ timed out".yellow(), secs),
        Outcome::DispatchError => format!(
            "{} {}: {}",
            tag,
            "✗ could not start".red(),
            result.first_error_line().unwrap_or("unknown error")
        ),
    }
}

/// Human-readable summary for the console.
pub fn render(report: &FleetReport) -> String {
    let mut out = String::new();
    let rule = "=".repeat(50);

    let _ = writeln!(out, "{}", "Deployment report".bold());
    let _ = writeln!(out, "{}", rule);
    for entry in &report.results {
        let status = match entry.outcome {
            Outcome::Succeeded => "OK     ".green(),
            Outcome::Failed => "FAILED ".red(),
            Outcome::TimedOut => "TIMEOUT".yellow(),
            Outcome::DispatchError => "ERROR  ".red(),
        };
        let _ = writeln!(
            out,
            "{} {:<24} ({:.2}s)",
            status, entry.host, entry.duration_secs
        );
        if !entry.success {
            for line in entry
                .stderr
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .take(ERROR_LINES_SHOWN)
            {
                let _ = writeln!(out, "   Error: {}", line);
            }
        }
    }
    let _ = writeln!(out, "{}", rule);

    let _ = writeln!(out, "  Successful: {}", report.successful);
    let _ = writeln!(out, "  Failed:     {}", report.failed);
    for (outcome, label) in [
        (Outcome::Failed, "remote failure"),
        (Outcome::TimedOut, "timed out"),
        (Outcome::DispatchError, "could not start"),
    ] {
        let n = report.count(outcome);
        if n > 0 {
            let _ = writeln!(out, "    {:<16} {}", label, n);
        }
    }
    if let Some(elapsed) = report.elapsed_secs {
        let _ = writeln!(out, "  Total time: {:.1}s", elapsed);
    }

    let verdict = match report.status {
        FleetStatus::AllSucceeded => "All deployments succeeded.".green().bold(),
        FleetStatus::Partial => format!(
            "Partial deployment: {} succeeded, {} failed.",
            report.successful, report.failed
        )
        .yellow()
        .bold(),
        FleetStatus::AllFailed => "All deployments failed.".red().bold(),
    };
    let _ = writeln!(out, "\n{}", verdict);
    out
}

/// Writes `report` to `path`: YAML for `.yaml`/`.yml`, JSON otherwise.
pub fn persist(report: &FleetReport, path: impl AsRef<Path>) -> Result<(), FleetError> {
    let path = path.as_ref();
    let yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let encoded = if yaml {
        serde_yaml::to_string(report).map_err(|e| FleetError::ReportEncode(e.to_string()))?
    } else {
        serde_json::to_string_pretty(report).map_err(|e| FleetError::ReportEncode(e.to_string()))?
    };
    std::fs::write(path, encoded).map_err(|source| FleetError::ReportWrite {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::info!(path = %path.display(), "Report written");
    Ok(())
}

/// Writes the hosts that did not succeed as a host list, for a follow-up run.
/// Returns how many hosts were written.
pub fn write_retry_list(report: &FleetReport, path: impl AsRef<Path>) -> Result<usize, FleetError> {
    let path = path.as_ref();
    let mut contents = format!(
        "# Hosts that did not succeed in the run at {}\n",
        report.timestamp.to_rfc3339()
    );
    let mut written = 0;
    for entry in report.failed_hosts() {
        let _ = writeln!(contents, "# {}", entry.outcome);
        let _ = writeln!(contents, "{}", entry.to_host().to_line());
        written += 1;
    }
    std::fs::write(path, contents).map_err(|source| FleetError::ReportWrite {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(written)
}
