//! Configuration for the dispatcher.
//!
//! Holds clap structs for command line arguments and flags, and the
//! settings the dispatcher is built from.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;

/// Program invoked per host when no `--command` template is given.
pub const DEFAULT_ACTION: &str = "./deploy-agent.sh";

#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Config {
    /// Host list, one `host:user:port:key` entry per line
    #[arg(default_value = "hosts.txt")]
    pub hosts_file: PathBuf,

    /// Maximum number of hosts deployed in parallel
    #[arg(long, short, default_value_t = 5)]
    pub workers: usize,

    /// Write a machine-readable report here (JSON, or YAML for .yaml/.yml)
    #[arg(long, short)]
    pub report: Option<PathBuf>,

    /// Ask the deployment action for a no-op dry run
    #[arg(long)]
    pub dry_run: bool,

    /// Per-host timeout in seconds
    #[arg(long, short, default_value_t = 300)]
    pub timeout: u64,

    /// Deployment program, invoked as `PROGRAM -u USER -p PORT [-k KEY] [--dry-run] HOST`
    #[arg(long, short, default_value = DEFAULT_ACTION, conflicts_with = "command")]
    pub action: PathBuf,

    /// Shell command template instead of a program, e.g. `ssh -p {{port}} {{user}}@{{host}} ...`
    #[arg(long, short)]
    pub command: Option<String>,

    /// Echo every output line of every host as it arrives
    #[arg(long)]
    pub stream: bool,

    /// Write the hosts that did not succeed to this file, in host list format
    #[arg(long)]
    pub retry_list: Option<PathBuf>,

    /// Write a commented sample host list to `hosts.example` and exit
    #[arg(long)]
    pub create_example: bool,
}

impl Config {
    pub fn mode(&self) -> Mode {
        if self.dry_run {
            Mode::Simulate
        } else {
            Mode::Live
        }
    }

    pub fn settings(&self) -> DispatchSettings {
        DispatchSettings {
            worker_cap: self.workers,
            mode: self.mode(),
            timeout: Duration::from_secs(self.timeout),
            stream: self.stream,
        }
    }
}

/// Whether the action may touch the remote target.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Live,
    Simulate,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Mode::Live => write!(f, "live"),
            Mode::Simulate => write!(f, "simulate"),
        }
    }
}

/// Knobs the dispatcher runs with.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Upper bound on concurrently running jobs. Zero is treated as one.
    pub worker_cap: usize,
    pub mode: Mode,
    /// Per-host deadline.
    pub timeout: Duration,
    /// Echo output lines live.
    pub stream: bool,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            worker_cap: 5,
            mode: Mode::Live,
            timeout: Duration::from_secs(300),
            stream: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Config::parse_from(["fleet-dispatch"]);
        assert_eq!(cli.hosts_file, PathBuf::from("hosts.txt"));
        assert_eq!(cli.workers, 5);
        assert_eq!(cli.mode(), Mode::Live);
        assert_eq!(cli.action, PathBuf::from(DEFAULT_ACTION));
        assert!(cli.report.is_none());
        assert_eq!(cli.settings().timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_short_aliases() {
        let cli = Config::parse_from([
            "fleet-dispatch",
            "-w",
            "10",
            "-r",
            "report.json",
            "--dry-run",
            "prod.txt",
        ]);
        assert_eq!(cli.workers, 10);
        assert_eq!(cli.report, Some(PathBuf::from("report.json")));
        assert_eq!(cli.mode(), Mode::Simulate);
        assert_eq!(cli.hosts_file, PathBuf::from("prod.txt"));
    }

    #[test]
    fn test_action_conflicts_with_command() {
        let result = Config::try_parse_from([
            "fleet-dispatch",
            "--action",
            "./x.sh",
            "--command",
            "echo {{host}}",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_help_does_not_parse_into_config() {
        let err = Config::try_parse_from(["fleet-dispatch", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }
}
