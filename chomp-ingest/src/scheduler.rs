//! One cron per distinct interval, each firing a batch of job callbacks in
//! a single thread-pool submission (sync adapters) or async-gather (spec.md
//! §4.7). Grounded on `mmoldb-ingest/src/main.rs`'s `tokio::spawn` +
//! `Notify`/`CancellationToken` orchestration and on croner's
//! `find_next_occurrence` polling loop, the same pattern
//! `examples/other_examples/.../cron_scheduler.rs.rs` uses to drive its own
//! per-table cron tasks.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chomp_core::Interval;
use chrono::Utc;
use croner::Cron;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub type Job = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job {0} is already registered")]
    DuplicateJob(String),
    #[error("invalid cron expression for interval {0:?}: {1}")]
    InvalidCron(Interval, String),
}

struct Slot {
    cron: Cron,
    jobs: Vec<(String, Job)>,
}

/// One cron-driven slot per distinct [`Interval`]; jobs sharing an interval
/// fire together on each tick (spec.md §3's "Cron slot").
pub struct Scheduler {
    slots: Mutex<HashMap<Interval, Slot>>,
    threaded: bool,
}

impl Scheduler {
    pub fn new(threaded: bool) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            threaded,
        }
    }

    /// Registers `job_id` under `interval`'s slot. A duplicate id anywhere
    /// in the scheduler is an error (spec.md §4.7).
    pub async fn add(&self, job_id: &str, interval: Interval, job: Job) -> Result<(), SchedulerError> {
        let mut slots = self.slots.lock().await;
        if slots.values().any(|s| s.jobs.iter().any(|(id, _)| id == job_id)) {
            return Err(SchedulerError::DuplicateJob(job_id.to_string()));
        }
        let slot = match slots.entry(interval) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                let cron = Cron::new(interval.to_cron())
                    .parse()
                    .map_err(|e| SchedulerError::InvalidCron(interval, e.to_string()))?;
                e.insert(Slot { cron, jobs: Vec::new() })
            }
        };
        slot.jobs.push((job_id.to_string(), job));
        Ok(())
    }

    /// Starts every interval's monitor task; returns their join handles.
    /// Each monitor sleeps until the cron's next fire, then either submits
    /// all the slot's jobs to the blocking pool and joins them (`threaded`),
    /// or awaits them concurrently (spec.md §4.7, §5).
    pub async fn start(self: Arc<Self>, cancel: CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        let intervals: Vec<Interval> = self.slots.lock().await.keys().copied().collect();
        let mut handles = Vec::with_capacity(intervals.len());
        for interval in intervals {
            let this = self.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move { this.monitor_interval(interval, cancel).await }));
        }
        handles
    }

    async fn monitor_interval(&self, interval: Interval, cancel: CancellationToken) {
        loop {
            let next = {
                let slots = self.slots.lock().await;
                let Some(slot) = slots.get(&interval) else { return };
                match slot.cron.find_next_occurrence(&Utc::now(), false) {
                    Ok(t) => t,
                    Err(e) => {
                        error!("cron scheduling failed for {interval:?}: {e}");
                        return;
                    }
                }
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => {
                    debug!("monitor for {interval:?} shutting down");
                    return;
                }
            }

            self.fire(interval).await;
        }
    }

    async fn fire(&self, interval: Interval) {
        let jobs: Vec<Job> = {
            let slots = self.slots.lock().await;
            match slots.get(&interval) {
                Some(slot) => slot.jobs.iter().map(|(_, j)| j.clone()).collect(),
                None => return,
            }
        };
        if jobs.is_empty() {
            return;
        }

        info!("firing {} job(s) for interval {:?}", jobs.len(), interval);

        if self.threaded {
            let handles: Vec<_> = jobs.into_iter().map(|job| tokio::spawn(async move { job().await })).collect();
            for h in handles {
                if let Err(e) = h.await {
                    error!("job task panicked: {e}");
                }
            }
        } else {
            futures::future::join_all(jobs.iter().map(|job| job())).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn duplicate_job_id_is_rejected() {
        let scheduler = Scheduler::new(false);
        let job: Job = Arc::new(|| Box::pin(async {}));
        scheduler.add("a", Interval::M1, job.clone()).await.unwrap();
        let err = scheduler.add("a", Interval::M1, job).await.unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateJob(_)));
    }

    #[tokio::test]
    async fn fire_runs_all_jobs_for_the_interval() {
        let scheduler = Scheduler::new(false);
        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..3 {
            let counter = counter.clone();
            let job: Job = Arc::new(move || {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            });
            scheduler.add(&format!("job-{i}"), Interval::M1, job).await.unwrap();
        }
        scheduler.fire(Interval::M1).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
