//! Fleet deployment dispatcher.
//!
//! Runs an external deployment action against every host of a host list, a bounded number at a
//! time, and reports what happened to each.

// Command line arguments and configuration.
pub mod config;
// How to parse and represent hosts.
pub mod host;
// The external action invoked per host.
pub mod action;
// Running and classifying a single host's deployment.
pub mod job;
// Write-once result storage.
pub mod store;
// Bounded concurrent dispatch.
pub mod dispatcher;
// Aggregation and output.
pub mod report;
// Error handling.
pub mod error;

pub use action::{Action, ScriptAction, TemplateAction};
pub use config::{Config, DispatchSettings, Mode};
pub use dispatcher::{spawn_job, Dispatcher, JobCompletion, WorkerSlots};
pub use error::FleetError;
pub use host::{load_hosts, parse_hosts, Host};
pub use job::{execute, DeploymentResult, Job, Outcome};
pub use report::{
    persist, render, run_exit_code, write_retry_list, FleetReport, FleetStatus, EXIT_FATAL,
};
pub use store::ResultStore;
