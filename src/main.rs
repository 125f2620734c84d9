use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use colored::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fleet_dispatch::host::EXAMPLE_HOSTS;
use fleet_dispatch::report::{persist, render, run_exit_code, write_retry_list, EXIT_FATAL};
use fleet_dispatch::{
    load_hosts, Action, Config, Dispatcher, FleetError, FleetReport, Mode, ScriptAction,
    TemplateAction,
};

const EXAMPLE_FILE: &str = "hosts.example";

fn build_action(cli: &Config) -> Result<Arc<dyn Action>, FleetError> {
    match &cli.command {
        Some(template) => Ok(Arc::new(TemplateAction::new(template)?)),
        None => {
            if !cli.action.exists() {
                // Every host will report this as a dispatch error; say it once up front too.
                tracing::warn!(action = %cli.action.display(), "Deployment action not found");
            }
            Ok(Arc::new(ScriptAction::new(&cli.action)))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleet_dispatch=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Config::parse();

    if cli.create_example {
        return match std::fs::write(EXAMPLE_FILE, EXAMPLE_HOSTS) {
            Ok(()) => {
                eprintln!("[fleet] Wrote sample host list to {}", EXAMPLE_FILE);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("[fleet] Failed to write {}: {}", EXAMPLE_FILE, e);
                ExitCode::from(EXIT_FATAL)
            }
        };
    }

    let hosts = match load_hosts(&cli.hosts_file) {
        Ok(hosts) => hosts,
        Err(e) => {
            eprintln!("[fleet] {}", e.to_string().red());
            if matches!(e, FleetError::SourceUnreadable { .. }) {
                eprintln!("[fleet] Create a sample with --create-example");
            }
            return ExitCode::from(EXIT_FATAL);
        }
    };

    let action = match build_action(&cli) {
        Ok(action) => action,
        Err(e) => {
            eprintln!("[fleet] {}", e.to_string().red());
            return ExitCode::from(EXIT_FATAL);
        }
    };

    let settings = cli.settings();
    eprintln!(
        "[fleet] Deploying to {} hosts (max {} parallel, {}s timeout)",
        hosts.len(),
        settings.worker_cap.max(1),
        settings.timeout.as_secs()
    );
    eprintln!("[fleet] Host list: {}", cli.hosts_file.display());
    if settings.mode == Mode::Simulate {
        eprintln!("[fleet] Mode: {}", "SIMULATION (dry run)".yellow());
    }

    let started = Instant::now();
    let dispatcher = Dispatcher::new(action, settings);
    let store = dispatcher.run(hosts).await;
    let report = FleetReport::summarize(&store)
        .await
        .with_run_info(cli.mode(), started.elapsed());

    println!();
    print!("{}", render(&report));

    let mut writes = Vec::new();
    if let Some(path) = &cli.report {
        writes.push(
            persist(&report, path)
                .map(|()| eprintln!("[fleet] Report saved to {}", path.display())),
        );
    }
    if let Some(path) = &cli.retry_list {
        writes.push(
            write_retry_list(&report, path)
                .map(|n| eprintln!("[fleet] {} hosts to retry written to {}", n, path.display())),
        );
    }
    for e in writes.iter().filter_map(|w| w.as_ref().err()) {
        eprintln!("[fleet] {}", e.to_string().red());
    }

    ExitCode::from(run_exit_code(report.status, &writes))
}
