//! Sweep that flushes counters whose scheduled flush never ran, e.g. records
//! that stopped receiving increments or schedules lost in an incident.

use std::sync::Arc;

use crate::backend::CounterBackend;
use crate::buffered::{BufferedCounter, FlushOutcome, LOG_TARGET};
use crate::error::CounterError;
use crate::record::CounterRecord;

/// Records checked per multi-key existence round trip.
pub const BATCH_SIZE: usize = 1000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushStaleReport {
    /// Counters inspected.
    pub checked: usize,
    /// Counters whose pending delta reached the durable store.
    pub flushed: usize,
}

pub struct FlushStaleCounterIncrements {
    backend: Arc<CounterBackend>,
}

impl FlushStaleCounterIncrements {
    pub fn new(backend: Arc<CounterBackend>) -> Self {
        Self { backend }
    }

    pub fn execute(&self, records: &[CounterRecord]) -> Result<FlushStaleReport, CounterError> {
        let mut report = FlushStaleReport::default();
        for chunk in records.chunks(BATCH_SIZE) {
            let counters: Vec<BufferedCounter> = chunk
                .iter()
                .flat_map(|record| {
                    self.backend
                        .attributes()
                        .buffered_attributes(&record.record_type)
                        .into_iter()
                        .map(move |attribute| (record, attribute))
                })
                .map(|(record, attribute)| self.backend.buffered_counter(record, &attribute))
                .collect::<Result<_, _>>()?;
            if counters.is_empty() {
                continue;
            }

            let keys: Vec<String> = counters
                .iter()
                .flat_map(|counter| [counter.key(), counter.flushed_key()])
                .collect();
            let present = self.backend.store().exists_many(&keys)?;

            for (counter, pair) in counters.iter().zip(present.chunks(2)) {
                report.checked += 1;
                if !pair.iter().any(|exists| *exists) {
                    continue;
                }
                if let FlushOutcome::Committed { .. } = counter.commit_increment()? {
                    report.flushed += 1;
                }
            }
        }
        tracing::info!(
            target: LOG_TARGET,
            checked = report.checked,
            flushed = report.flushed,
            "stale counter sweep finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use holdfast_kernel::{InMemoryKeyValueStore, KeyValueStore, Script, SharedStore};

    use super::*;
    use crate::attributes::{CounterAttributes, CounterMode};
    use crate::counter::Counter;
    use crate::record::FlushTarget;
    use crate::repository::InMemoryCounterRepository;
    use crate::scheduler::KvFlushScheduler;

    #[test]
    fn only_counters_with_pending_keys_are_committed() {
        let store: SharedStore = Arc::new(InMemoryKeyValueStore::new());
        let mut attributes = CounterAttributes::new();
        attributes
            .register("ProjectStatistics", "storage_size", CounterMode::Buffered)
            .register("ProjectStatistics", "build_artifacts_size", CounterMode::Buffered)
            .register("ProjectStatistics", "commit_count", CounterMode::Legacy);
        let backend = Arc::new(CounterBackend::new(
            store.clone(),
            Arc::new(InMemoryCounterRepository::new()),
            Arc::new(KvFlushScheduler::new(store.clone())),
            attributes,
        ));
        let records: Vec<CounterRecord> = (1..=3)
            .map(|id| CounterRecord::new(id, "ProjectStatistics", id))
            .collect();

        backend
            .counter_for(&records[0], "storage_size")
            .expect("counter")
            .increment(5)
            .expect("increment");
        // Half-finished flush on the third record: only the flushed key remains.
        let stuck = FlushTarget::new(records[2].clone(), "build_artifacts_size");
        store.incr_by(&stuck.key(), 8).expect("incr");
        store
            .eval(&Script::FlushIncrement {
                increment_key: stuck.key(),
                flushed_key: stuck.flushed_key(),
            })
            .expect("stage");

        let report = FlushStaleCounterIncrements::new(backend.clone())
            .execute(&records)
            .expect("execute");

        assert_eq!(report, FlushStaleReport { checked: 6, flushed: 2 });
        assert_eq!(
            backend
                .durable_value(&FlushTarget::new(records[0].clone(), "storage_size"))
                .expect("durable"),
            5
        );
        assert_eq!(backend.durable_value(&stuck).expect("durable"), 8);
        assert!(!store.exists(&stuck.flushed_key()).expect("exists"));
    }
}
