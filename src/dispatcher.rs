//! Bounded fan-out of jobs across the fleet.
//!
//! The dispatcher loop owns a fixed number of worker slots. It hands a slot to each pending host
//! until none are free, then waits for a worker to report completion on a flume channel before
//! scheduling the next host. Workers write their own result into the shared `ResultStore`.

use std::sync::Arc;

use colored::Colorize;
use colourado::{ColorPalette, PaletteType};
use futures::future::join_all;
use itertools::zip;

use crate::action::Action;
use crate::config::DispatchSettings;
use crate::host::Host;
use crate::job::{execute, DeploymentResult, Job, Outcome};
use crate::report::progress_line;
use crate::store::ResultStore;

/// Tracks how many workers are busy.
#[derive(Debug)]
pub struct WorkerSlots {
    /// Maximum number of concurrently running jobs.
    cap: usize,
    /// Currently running jobs.
    in_use: usize,
    /// Highest `in_use` ever observed.
    peak: usize,
}

impl WorkerSlots {
    /// Creates a pool with `cap` slots. A cap of zero is raised to one.
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            in_use: 0,
            peak: 0,
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn free(&self) -> usize {
        self.cap - self.in_use
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    pub fn peak(&self) -> usize {
        self.peak
    }

    /// Takes a slot if one is free.
    pub fn try_acquire(&mut self) -> bool {
        if self.in_use == self.cap {
            return false;
        }
        self.in_use += 1;
        self.peak = self.peak.max(self.in_use);
        true
    }

    /// Returns a slot to the pool.
    pub fn release(&mut self) {
        self.in_use = self.in_use.saturating_sub(1);
    }
}

/// Message sent from worker task to the dispatcher when a job completes.
#[derive(Debug)]
pub struct JobCompletion {
    /// Index of the host whose job completed.
    pub host_index: usize,
    /// `None` if the worker died before producing a result.
    pub outcome: Option<Outcome>,
}

/// Sends a `JobCompletion` when dropped, so the dispatcher hears back even from a worker that
/// panicked.
struct CompletionNotice {
    tx: flume::Sender<JobCompletion>,
    host_index: usize,
    outcome: Option<Outcome>,
}

impl Drop for CompletionNotice {
    fn drop(&mut self) {
        let _ = self.tx.send(JobCompletion {
            host_index: self.host_index,
            outcome: self.outcome,
        });
    }
}

/// Spawns an async task that runs `job` and records its result in `store`.
pub fn spawn_job(
    action: Arc<dyn Action>,
    job: Job,
    host_index: usize,
    store: ResultStore,
    completion_tx: flume::Sender<JobCompletion>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut notice = CompletionNotice {
            tx: completion_tx,
            host_index,
            outcome: None,
        };
        let tag = job.tag.clone();

        println!(
            "{} Deploying as {} on port {} ({})",
            tag, job.host.user, job.host.port, job.mode
        );
        let result = execute(action.as_ref(), job).await;
        println!("{}", progress_line(&tag, &result));

        notice.outcome = Some(result.outcome);
        let address = result.host.address.clone();
        if let Err(e) = store.insert(result).await {
            tracing::error!(host = %address, error = %e, "Dropped result");
        }
    })
}

/// Runs one job per host with at most `worker_cap` running at a time.
pub struct Dispatcher {
    action: Arc<dyn Action>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(action: Arc<dyn Action>, settings: DispatchSettings) -> Self {
        Self { action, settings }
    }

    /// Deploys to every host and returns once each one has a result.
    pub async fn run(&self, hosts: Vec<Host>) -> ResultStore {
        self.run_with_slots(hosts).await.0
    }

    /// Like `run`, also returning the slot pool to inspect how busy it got.
    pub async fn run_with_slots(&self, hosts: Vec<Host>) -> (ResultStore, WorkerSlots) {
        let store = ResultStore::new();
        let mut slots = WorkerSlots::new(self.settings.worker_cap);
        if hosts.is_empty() {
            return (store, slots);
        }

        let mut colors = ColorPalette::new(hosts.len() as u32, PaletteType::Pastel, false)
            .colors
            .into_iter();
        let jobs: Vec<Job> = hosts
            .into_iter()
            .map(|host| {
                let tag = match colors.next() {
                    Some(color) => host.prettify(color),
                    None => host.to_string().normal(),
                };
                Job::new(host, self.settings.mode, self.settings.timeout)
                    .with_tag(tag)
                    .with_stream(self.settings.stream)
            })
            .collect();

        // Workers notify through this channel; the loop below is the only consumer.
        let (completion_tx, completion_rx) = flume::unbounded::<JobCompletion>();
        let mut running: Vec<(Host, tokio::task::JoinHandle<()>)> = Vec::with_capacity(jobs.len());
        let mut pending = jobs.into_iter().enumerate();

        loop {
            // Fill every free slot before waiting.
            while slots.free() > 0 {
                let Some((host_index, job)) = pending.next() else {
                    break;
                };
                slots.try_acquire();
                tracing::debug!(
                    host = %job.host.address,
                    in_use = slots.in_use(),
                    cap = slots.cap(),
                    "Dispatching"
                );
                let host = job.host.clone();
                let task = spawn_job(
                    Arc::clone(&self.action),
                    job,
                    host_index,
                    store.clone(),
                    completion_tx.clone(),
                );
                running.push((host, task));
            }

            if slots.in_use() == 0 {
                break;
            }

            match completion_rx.recv_async().await {
                Ok(completion) => {
                    tracing::debug!(
                        host_index = completion.host_index,
                        outcome = ?completion.outcome,
                        "Worker finished"
                    );
                    slots.release();
                }
                // Unreachable while we hold `completion_tx`.
                Err(_) => break,
            }
        }
        drop(completion_tx);

        // Every worker has reported; join them so none outlives the run.
        let (hosts, tasks): (Vec<_>, Vec<_>) = running.into_iter().unzip();
        for (host, joined) in zip(hosts, join_all(tasks).await) {
            if let Err(e) = joined {
                tracing::error!(host = %host.address, error = %e, "Worker task failed");
                // Only record if the worker died before writing its result.
                if store.get(&host.address).await.is_none() {
                    let result = DeploymentResult::dispatch_error(
                        host,
                        std::time::Duration::ZERO,
                        format!("Worker task failed: {}", e),
                    );
                    let _ = store.insert(result).await;
                }
            }
        }

        (store, slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_respect_cap() {
        let mut slots = WorkerSlots::new(2);
        assert!(slots.try_acquire());
        assert!(slots.try_acquire());
        assert!(!slots.try_acquire());
        assert_eq!(slots.free(), 0);
        assert_eq!(slots.peak(), 2);
    }

    #[test]
    fn test_release_enables_new_acquire() {
        let mut slots = WorkerSlots::new(1);
        assert!(slots.try_acquire());
        assert!(!slots.try_acquire());
        slots.release();
        assert_eq!(slots.free(), 1);
        assert!(slots.try_acquire());
        assert_eq!(slots.peak(), 1);
    }

    #[test]
    fn test_zero_cap_is_raised_to_one() {
        let mut slots = WorkerSlots::new(0);
        assert_eq!(slots.cap(), 1);
        assert!(slots.try_acquire());
        assert!(!slots.try_acquire());
    }

    #[test]
    fn test_release_never_underflows() {
        let mut slots = WorkerSlots::new(3);
        slots.release();
        assert_eq!(slots.in_use(), 0);
        assert_eq!(slots.free(), 3);
    }

    #[test]
    fn test_peak_tracks_high_water_mark() {
        let mut slots = WorkerSlots::new(4);
        slots.try_acquire();
        slots.try_acquire();
        slots.try_acquire();
        slots.release();
        slots.release();
        slots.try_acquire();
        assert_eq!(slots.in_use(), 2);
        assert_eq!(slots.peak(), 3);
    }

    #[tokio::test]
    async fn test_empty_host_list_returns_empty_store() {
        let action = Arc::new(crate::action::TemplateAction::new("true").unwrap());
        let dispatcher = Dispatcher::new(action, DispatchSettings::default());
        let store = dispatcher.run(vec![]).await;
        assert!(store.is_empty().await);
    }
}
