use std::sync::Arc;

use crate::backend::CounterBackend;
use crate::buffered::{FlushOutcome, LOG_TARGET};
use crate::error::CounterError;
use crate::scheduler::ScheduledFlush;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushRunReport {
    pub committed: usize,
    pub idle: usize,
    /// Left in the schedule for the next run.
    pub contended: usize,
    /// Undecodable or no longer registered as buffered.
    pub dropped: usize,
    /// Commit failed; left in the schedule for the next run.
    pub failed: usize,
}

/// Drains due entries from the flush schedule.
pub struct FlushWorker {
    backend: Arc<CounterBackend>,
}

impl FlushWorker {
    pub fn new(backend: Arc<CounterBackend>) -> Self {
        Self { backend }
    }

    /// Commit up to `limit` due flushes. An entry is removed only after its
    /// commit succeeded, so a crash re-runs it instead of skipping it.
    pub fn run_due(&self, limit: usize) -> Result<FlushRunReport, CounterError> {
        let scheduler = self.backend.scheduler();
        let mut report = FlushRunReport::default();

        for entry in scheduler.due(limit)? {
            let scheduled = match serde_json::from_str::<ScheduledFlush>(&entry) {
                Ok(scheduled) => scheduled,
                Err(err) => {
                    tracing::warn!(target: LOG_TARGET, error = %err, "dropping undecodable flush entry");
                    scheduler.complete(&entry)?;
                    report.dropped += 1;
                    continue;
                }
            };
            let target = scheduled.target;
            let counter = match self
                .backend
                .buffered_counter(&target.record, &target.attribute)
            {
                Ok(counter) => counter,
                Err(err) => {
                    tracing::warn!(target: LOG_TARGET, key = %target.key(), error = %err, "dropping flush for unregistered counter");
                    scheduler.complete(&entry)?;
                    report.dropped += 1;
                    continue;
                }
            };

            match counter.commit_increment() {
                Ok(FlushOutcome::Committed { .. }) => {
                    scheduler.complete(&entry)?;
                    report.committed += 1;
                }
                Ok(FlushOutcome::NothingToFlush { .. }) => {
                    scheduler.complete(&entry)?;
                    report.idle += 1;
                }
                Ok(FlushOutcome::Contended { .. }) => report.contended += 1,
                Err(err) => {
                    tracing::error!(target: LOG_TARGET, key = %target.key(), error = %err, "flush commit failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use holdfast_kernel::{InMemoryKeyValueStore, KeyValueStore, ManualClock, SharedStore};

    use super::*;
    use crate::attributes::{CounterAttributes, CounterMode};
    use crate::counter::Counter;
    use crate::record::CounterRecord;
    use crate::repository::InMemoryCounterRepository;
    use crate::scheduler::{KvFlushScheduler, FLUSH_SCHEDULE_KEY};

    fn setup() -> (Arc<CounterBackend>, Arc<ManualClock>, SharedStore) {
        let clock = Arc::new(ManualClock::default());
        let store: SharedStore = Arc::new(InMemoryKeyValueStore::with_clock(clock.clone()));
        let mut attributes = CounterAttributes::new();
        attributes.register("ProjectStatistics", "storage_size", CounterMode::Buffered);
        let backend = Arc::new(CounterBackend::new(
            store.clone(),
            Arc::new(InMemoryCounterRepository::new()),
            Arc::new(KvFlushScheduler::with_clock(store.clone(), clock.clone())),
            attributes,
        ));
        (backend, clock, store)
    }

    #[test]
    fn due_flushes_are_committed_once() {
        let (backend, clock, store) = setup();
        let record = CounterRecord::new(1, "ProjectStatistics", 1);
        let counter = backend.counter_for(&record, "storage_size").expect("counter");
        for _ in 0..5 {
            counter.increment(2).expect("increment");
        }
        let worker = FlushWorker::new(backend.clone());

        assert_eq!(worker.run_due(10).expect("run"), FlushRunReport::default());

        clock.advance(ChronoDuration::minutes(10));
        let report = worker.run_due(10).expect("run");
        assert_eq!(report.committed, 1);
        assert_eq!(backend.durable_value(counter.target()).expect("durable"), 10);
        assert_eq!(store.zcard(FLUSH_SCHEDULE_KEY).expect("zcard"), 0);
    }

    #[test]
    fn bad_entries_are_dropped() {
        let (backend, clock, store) = setup();
        store.zadd(FLUSH_SCHEDULE_KEY, 0, "garbage").expect("zadd");
        let stale = ScheduledFlush {
            target: crate::record::FlushTarget::new(CounterRecord::new(1, "Gone", 1), "x"),
            due_at_ms: 0,
        };
        store
            .zadd(FLUSH_SCHEDULE_KEY, 0, &serde_json::to_string(&stale).expect("encode"))
            .expect("zadd");
        clock.advance(ChronoDuration::seconds(1));

        let report = FlushWorker::new(backend).run_due(10).expect("run");
        assert_eq!(report.dropped, 2);
        assert_eq!(store.zcard(FLUSH_SCHEDULE_KEY).expect("zcard"), 0);
    }
}
