//! Delayed flush scheduling with at most one pending flush per counter.
//!
//! A marker key `"{counter key}:flush-scheduled"` is written with `SET NX` and a
//! TTL equal to the flush delay. Only the caller that creates the marker adds an
//! entry to the `counters:flush_schedule` sorted set, scored by due time, so a
//! burst of increments queues one flush, not one per increment.

use std::sync::Arc;
use std::time::Duration;

use holdfast_kernel::clock::expiry_after;
use holdfast_kernel::{Clock, ScoreRange, SharedStore, SystemClock};
use serde::{Deserialize, Serialize};

use crate::error::CounterError;
use crate::record::FlushTarget;

pub const FLUSH_SCHEDULE_KEY: &str = "counters:flush_schedule";

/// Member of the schedule set. The due time keeps entries from successive
/// delay windows distinct.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledFlush {
    pub target: FlushTarget,
    pub due_at_ms: i64,
}

pub trait FlushScheduler: Send + Sync {
    /// Returns true when this call queued a new flush.
    fn schedule(&self, target: &FlushTarget, delay: Duration) -> Result<bool, CounterError>;

    /// Raw entries whose due time has passed, oldest first.
    fn due(&self, limit: usize) -> Result<Vec<String>, CounterError>;

    fn complete(&self, entry: &str) -> Result<(), CounterError>;
}

#[derive(Clone)]
pub struct KvFlushScheduler {
    store: SharedStore,
    clock: Arc<dyn Clock>,
}

impl KvFlushScheduler {
    pub fn new(store: SharedStore) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: SharedStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn pending(&self) -> Result<u64, CounterError> {
        Ok(self.store.zcard(FLUSH_SCHEDULE_KEY)?)
    }
}

impl FlushScheduler for KvFlushScheduler {
    fn schedule(&self, target: &FlushTarget, delay: Duration) -> Result<bool, CounterError> {
        if !self.store.set_nx(&target.schedule_marker_key(), "1", delay)? {
            return Ok(false);
        }
        let due_at_ms = expiry_after(self.clock.now(), delay).timestamp_millis();
        let entry = serde_json::to_string(&ScheduledFlush {
            target: target.clone(),
            due_at_ms,
        })?;
        self.store.zadd(FLUSH_SCHEDULE_KEY, due_at_ms, &entry)?;
        Ok(true)
    }

    fn due(&self, limit: usize) -> Result<Vec<String>, CounterError> {
        let now_ms = self.clock.now().timestamp_millis();
        Ok(self
            .store
            .zrange_by_score(FLUSH_SCHEDULE_KEY, ScoreRange::up_to(now_ms), limit)?
            .into_iter()
            .map(|(entry, _)| entry)
            .collect())
    }

    fn complete(&self, entry: &str) -> Result<(), CounterError> {
        self.store.zrem(FLUSH_SCHEDULE_KEY, entry)?;
        Ok(())
    }
}
