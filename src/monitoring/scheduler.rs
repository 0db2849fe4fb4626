//! Periodic job scheduling
//!
//! Named jobs run at second-granularity intervals on the cooperative
//! runtime. Each job body runs on its own task so a slow poll never
//! blocks the scheduler loop or sibling jobs.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::info;

/// Introspection snapshot for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    /// Whether the job's ticker task is alive.
    pub running: bool,
    /// Time until the next firing.
    pub next_run_in: Option<Duration>,
}

struct Job {
    handle: JoinHandle<()>,
    next_run_at: Arc<Mutex<Instant>>,
}

/// Registry of named periodic jobs.
#[derive(Default)]
pub struct Scheduler {
    jobs: DashMap<String, Job>,
}

impl Scheduler {
    /// Creates an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a periodic job, replacing any existing job with the
    /// same id. The first run happens one interval from now.
    pub fn add_job<F, Fut>(&self, id: &str, interval: Duration, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.remove_job(id);

        let next_run_at = Arc::new(Mutex::new(Instant::now() + interval));
        let tracker = Arc::clone(&next_run_at);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so the job
            // first fires one interval from registration
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Ok(mut next) = tracker.lock() {
                    *next = Instant::now() + interval;
                }
                tokio::spawn(job());
            }
        });

        info!(job_id = id, interval_secs = interval.as_secs(), "registered polling job");
        self.jobs.insert(id.to_string(), Job { handle, next_run_at });
    }

    /// Cancels and removes a job. Returns whether it existed.
    pub fn remove_job(&self, id: &str) -> bool {
        if let Some((_, job)) = self.jobs.remove(id) {
            job.handle.abort();
            info!(job_id = id, "removed polling job");
            true
        } else {
            false
        }
    }

    /// Status of one job, or `None` for an unknown id.
    #[must_use]
    pub fn status(&self, id: &str) -> Option<JobStatus> {
        self.jobs.get(id).map(|job| {
            let next_run_in = job
                .next_run_at
                .lock()
                .ok()
                .map(|next| next.saturating_duration_since(Instant::now()));
            JobStatus {
                running: !job.handle.is_finished(),
                next_run_in,
            }
        })
    }

    /// Ids of all registered jobs.
    #[must_use]
    pub fn job_ids(&self) -> Vec<String> {
        self.jobs.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Cancels every job.
    pub fn shutdown(&self) {
        let ids = self.job_ids();
        for id in ids {
            self.remove_job(&id);
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
