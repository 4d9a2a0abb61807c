//! Out-of-band driver that releases waiting jobs once their strategy unpauses.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use holdfast_kernel::{in_lock, ExclusiveLease, SharedStore};

use crate::error::PauseControlError;
use crate::queue::{JobSubmitter, PauseControlQueue};
use crate::strategy::{PauseStrategy, LOG_TARGET};
use crate::toggle::PauseToggle;
use crate::workers_map::WorkersMap;

/// How soon to tick again when a queue still had jobs after its batch.
pub const RESCHEDULE_DELAY: Duration = Duration::from_secs(1);
pub const RESUME_DRIVER_LEASE_KEY: &str = "pause_control:resume_driver";
const DEFAULT_DRIVER_LEASE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResumeReport {
    /// Remaining waiting-queue size for every worker that was resumed.
    pub resumed: BTreeMap<String, u64>,
    /// Some queue still has jobs; tick again after [RESCHEDULE_DELAY].
    pub reschedule: bool,
    /// Another driver held the lease; nothing was done.
    pub contended: bool,
    /// Workers whose resume failed this tick, with the error. They keep their
    /// jobs and are retried on the next tick.
    pub failed: BTreeMap<String, String>,
}

pub struct ResumeDriver {
    workers: Arc<WorkersMap>,
    queue: Arc<PauseControlQueue>,
    toggle: Arc<dyn PauseToggle>,
    submitter: Arc<dyn JobSubmitter>,
    iterations: usize,
    lease: ExclusiveLease,
}

impl ResumeDriver {
    pub fn new(
        workers: Arc<WorkersMap>,
        queue: Arc<PauseControlQueue>,
        toggle: Arc<dyn PauseToggle>,
        submitter: Arc<dyn JobSubmitter>,
    ) -> Self {
        let store: SharedStore = queue.store().clone();
        Self {
            workers,
            queue,
            toggle,
            submitter,
            iterations: 1,
            lease: ExclusiveLease::new(store, RESUME_DRIVER_LEASE_KEY, DEFAULT_DRIVER_LEASE_TTL),
        }
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations.max(1);
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease = ExclusiveLease::new(self.queue.store().clone(), RESUME_DRIVER_LEASE_KEY, ttl);
        self
    }

    /// One sweep over every bound worker whose strategy is not pausing it.
    pub fn tick(&self) -> Result<ResumeReport, PauseControlError> {
        let swept = in_lock(&self.lease, || self.sweep())?;
        Ok(swept.unwrap_or_else(|| ResumeReport {
            contended: true,
            ..ResumeReport::default()
        }))
    }

    fn sweep(&self) -> Result<ResumeReport, PauseControlError> {
        let mut report = ResumeReport::default();
        for (strategy, workers) in self.workers.workers() {
            for worker in workers {
                match self.resume_worker(strategy, &worker) {
                    Ok(None) => {}
                    Ok(Some(remaining)) => {
                        tracing::info!(
                            target: LOG_TARGET,
                            worker = %worker,
                            strategy = strategy.as_str(),
                            remaining,
                            "resumed waiting queue"
                        );
                        report.reschedule |= remaining > 0;
                        report.resumed.insert(worker, remaining);
                    }
                    Err(err) => {
                        tracing::error!(
                            target: LOG_TARGET,
                            worker = %worker,
                            strategy = strategy.as_str(),
                            error = %err,
                            "resuming waiting queue failed"
                        );
                        report.reschedule = true;
                        report.failed.insert(worker, err.to_string());
                    }
                }
            }
        }
        Ok(report)
    }

    /// Remaining queue size after resuming `worker`, `None` when it was left alone.
    fn resume_worker(&self, strategy: PauseStrategy, worker: &str) -> Result<Option<u64>, PauseControlError> {
        if strategy.should_pause(worker, self.toggle.as_ref())? {
            return Ok(None);
        }
        if !self.queue.has_jobs_in_waiting_queue(worker)? {
            return Ok(None);
        }
        self.queue
            .resume_processing(worker, self.iterations, self.submitter.as_ref())
            .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use holdfast_kernel::InMemoryKeyValueStore;
    use serde_json::json;

    use super::*;
    use crate::job::JobPayload;
    use crate::live_queue::{InMemoryLiveQueue, LiveQueue};
    use crate::toggle::StaticPauseToggle;

    struct Fixture {
        driver: ResumeDriver,
        queue: Arc<PauseControlQueue>,
        toggle: Arc<StaticPauseToggle>,
        live: Arc<InMemoryLiveQueue>,
    }

    fn fixture(batch_limit: usize) -> Fixture {
        let mut workers = WorkersMap::new();
        workers.set_strategy_for("worker_toggle", "Export").expect("bind");
        workers.set_strategy_for("search_indexing", "Search::IndexWorker").expect("bind");
        let queue = Arc::new(
            PauseControlQueue::new(Arc::new(InMemoryKeyValueStore::new())).with_batch_limit(batch_limit),
        );
        let toggle = Arc::new(StaticPauseToggle::new());
        let live = Arc::new(InMemoryLiveQueue::new());
        let driver = ResumeDriver::new(Arc::new(workers), queue.clone(), toggle.clone(), live.clone());
        Fixture {
            driver,
            queue,
            toggle,
            live,
        }
    }

    fn park(queue: &PauseControlQueue, worker: &str, n: usize) {
        for i in 0..n {
            queue
                .add_to_waiting_queue(&JobPayload::new(worker, vec![json!(i)]))
                .expect("add");
        }
    }

    #[test]
    fn paused_strategies_are_left_alone() {
        let f = fixture(10);
        park(&f.queue, "Export", 2);
        park(&f.queue, "Search::IndexWorker", 2);
        f.toggle.enable("search_indexing").expect("enable");

        let report = f.driver.tick().expect("tick");

        assert_eq!(report.resumed.get("Export"), Some(&0));
        assert!(!report.resumed.contains_key("Search::IndexWorker"));
        assert!(!report.reschedule);
        assert_eq!(f.live.len("Export").expect("len"), 2);
        assert_eq!(f.queue.queue_size("Search::IndexWorker").expect("size"), 2);
    }

    #[test]
    fn leftover_jobs_request_a_reschedule() {
        let f = fixture(2);
        park(&f.queue, "Export", 3);

        let first = f.driver.tick().expect("tick");
        assert!(first.reschedule);
        assert_eq!(first.resumed.get("Export"), Some(&1));

        let second = f.driver.tick().expect("tick");
        assert!(!second.reschedule);
        assert_eq!(f.live.len("Export").expect("len"), 3);
    }

    /// Forwards to a live queue, except for one worker whose submits always fail.
    struct FlakySubmitter {
        live: Arc<InMemoryLiveQueue>,
        broken: &'static str,
    }

    impl JobSubmitter for FlakySubmitter {
        fn submit(&self, job: &JobPayload) -> Result<(), PauseControlError> {
            if job.worker == self.broken {
                return Err(PauseControlError::Submit {
                    worker: job.worker.clone(),
                    reason: "down".into(),
                });
            }
            self.live.push(job)
        }
    }

    #[test]
    fn a_failing_worker_does_not_stall_the_others() {
        let mut workers = WorkersMap::new();
        workers.set_strategy_for("worker_toggle", "Alpha").expect("bind");
        workers.set_strategy_for("worker_toggle", "Beta").expect("bind");
        let queue = Arc::new(PauseControlQueue::new(Arc::new(InMemoryKeyValueStore::new())));
        let live = Arc::new(InMemoryLiveQueue::new());
        let submitter = Arc::new(FlakySubmitter {
            live: live.clone(),
            broken: "Alpha",
        });
        let driver = ResumeDriver::new(
            Arc::new(workers),
            queue.clone(),
            Arc::new(StaticPauseToggle::new()),
            submitter,
        );
        park(&queue, "Alpha", 1);
        park(&queue, "Beta", 1);

        let report = driver.tick().expect("tick");

        assert!(report.failed.contains_key("Alpha"));
        assert!(report.reschedule);
        assert_eq!(report.resumed.get("Beta"), Some(&0));
        assert_eq!(live.len("Beta").expect("len"), 1);
        assert_eq!(queue.queue_size("Alpha").expect("size"), 1);

        let retried = driver.tick().expect("tick");
        assert!(retried.failed.contains_key("Alpha"));
        assert!(!retried.contended);
    }

    #[test]
    fn a_held_lease_skips_the_tick() {
        let f = fixture(10);
        park(&f.queue, "Export", 1);
        let rival = ExclusiveLease::new(
            f.queue.store().clone(),
            RESUME_DRIVER_LEASE_KEY,
            Duration::from_secs(60),
        );
        let token = rival.try_obtain().expect("obtain").expect("free");

        let report = f.driver.tick().expect("tick");
        assert!(report.contended);
        assert_eq!(f.queue.queue_size("Export").expect("size"), 1);

        rival.cancel(&token).expect("cancel");
        assert!(!f.driver.tick().expect("tick").contended);
        assert_eq!(f.queue.queue_size("Export").expect("size"), 0);
    }
}
