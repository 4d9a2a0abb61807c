//! Buffered counter: increments land in the shared store and are committed to
//! the durable repository in batches.
//!
//! Each counter uses two keys. `key` collects new increments; `flushed_key`
//! holds what a flush has taken from `key` but not yet committed. A flush moves
//! `key` into `flushed_key` atomically, commits `flushed_key`, then deletes it in
//! the same durable transaction. A flush that dies half way leaves its amount in
//! `flushed_key`, and the next flush picks it up together with anything new.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use holdfast_kernel::{in_lock, ExclusiveLease, Script, SharedStore, StoreError};

use crate::backend::CounterBackend;
use crate::counter::Counter;
use crate::error::CounterError;
use crate::record::FlushTarget;

pub(crate) const LOG_TARGET: &str = "holdfast::counters";
const RESET_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Result of [BufferedCounter::commit_increment]. Every variant carries the
/// durable value as of the end of the call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    /// `amount` reached the durable store, which now holds `value`.
    Committed { amount: i64, value: i64 },
    /// Nothing pending, or increments cancelled out.
    NothingToFlush { value: i64 },
    /// Another flush holds the lease and will do the work.
    Contended { value: i64 },
}

impl FlushOutcome {
    pub fn value(&self) -> i64 {
        match *self {
            FlushOutcome::Committed { value, .. }
            | FlushOutcome::NothingToFlush { value }
            | FlushOutcome::Contended { value } => value,
        }
    }
}

#[derive(Clone)]
pub struct BufferedCounter {
    backend: Arc<CounterBackend>,
    target: FlushTarget,
}

impl BufferedCounter {
    pub(crate) fn new(backend: Arc<CounterBackend>, target: FlushTarget) -> Self {
        Self { backend, target }
    }

    pub fn key(&self) -> String {
        self.target.key()
    }

    pub fn flushed_key(&self) -> String {
        self.target.flushed_key()
    }

    fn store(&self) -> &SharedStore {
        self.backend.store()
    }

    fn read_integer(&self, key: &str) -> Result<i64, CounterError> {
        match self.store().get(key)? {
            None => Ok(0),
            Some(raw) => raw
                .parse()
                .map_err(|_| CounterError::Store(StoreError::NotAnInteger(key.to_string()))),
        }
    }

    /// Everything not yet durable, including a half-finished flush.
    pub fn amount_to_be_flushed(&self) -> Result<i64, CounterError> {
        Ok(self.read_integer(&self.key())? + self.read_integer(&self.flushed_key())?)
    }

    /// Commit the pending delta to the durable store.
    ///
    /// Returns [FlushOutcome::Contended] without error when another flush of the
    /// same counter is running.
    pub fn commit_increment(&self) -> Result<FlushOutcome, CounterError> {
        match in_lock(&self.lease(), || self.commit_locked())? {
            Some(outcome) => Ok(outcome),
            None => Ok(FlushOutcome::Contended {
                value: self.backend.repository().read(&self.target)?,
            }),
        }
    }

    fn lease(&self) -> ExclusiveLease {
        ExclusiveLease::new(
            self.store().clone(),
            self.target.lease_key(),
            self.backend.config().lease_ttl,
        )
    }

    fn commit_locked(&self) -> Result<FlushOutcome, CounterError> {
        let flushed_key = self.flushed_key();
        let amount = self.store().eval(&Script::FlushIncrement {
            increment_key: self.key(),
            flushed_key: flushed_key.clone(),
        })?;
        if amount == 0 {
            tracing::debug!(target: LOG_TARGET, key = %self.key(), "nothing to flush");
            return Ok(FlushOutcome::NothingToFlush {
                value: self.backend.repository().read(&self.target)?,
            });
        }

        let store = self.store();
        let value = self
            .backend
            .repository()
            .increment_in_transaction(&self.target, amount, &|| {
                store.del(&[flushed_key.as_str()])?;
                Ok(())
            })?;

        self.backend.callbacks().fire(&self.target, value);
        tracing::info!(
            target: LOG_TARGET,
            event = "flush_committed",
            key = %self.key(),
            amount,
            value,
            "buffered counter flushed"
        );
        Ok(FlushOutcome::Committed { amount, value })
    }

    /// The increment has already landed when this runs, so a failure is only
    /// logged; the stale-increment sweep picks the counter up later.
    fn schedule_flush(&self) {
        let delay = self.backend.config().flush_delay;
        match self.backend.scheduler().schedule(&self.target, delay) {
            Ok(true) => {
                tracing::debug!(target: LOG_TARGET, key = %self.key(), ?delay, "flush scheduled")
            }
            Ok(false) => {}
            Err(err) => tracing::warn!(
                target: LOG_TARGET,
                key = %self.key(),
                error = %err,
                "could not schedule flush"
            ),
        }
    }

    fn reset_locked(&self) -> Result<(), CounterError> {
        self.backend.repository().reset(&self.target)?;
        self.store()
            .del(&[self.key().as_str(), self.flushed_key().as_str()])?;
        self.backend.callbacks().fire(&self.target, 0);
        Ok(())
    }
}

impl Counter for BufferedCounter {
    fn target(&self) -> &FlushTarget {
        &self.target
    }

    fn increment(&self, amount: i64) -> Result<i64, CounterError> {
        let total = self.store().incr_by(&self.key(), amount)?;
        self.schedule_flush();
        Ok(total)
    }

    fn bulk_increment(&self, amounts: &[i64]) -> Result<i64, CounterError> {
        if amounts.is_empty() {
            return self.get();
        }
        let key = self.key();
        let increments: Vec<(String, i64)> = amounts.iter().map(|amount| (key.clone(), *amount)).collect();
        let totals = self.store().incr_by_many(&increments)?;
        self.schedule_flush();
        Ok(totals.last().copied().unwrap_or(0))
    }

    fn get(&self) -> Result<i64, CounterError> {
        self.read_integer(&self.key())
    }

    /// Zero the durable value and drop anything pending. Waits for a running
    /// flush to finish so its amount cannot land after the reset.
    fn reset(&self) -> Result<(), CounterError> {
        let lease = self.lease();
        let deadline = Instant::now() + self.backend.config().reset_wait;
        loop {
            if in_lock(&lease, || self.reset_locked())?.is_some() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(CounterError::LeaseHeld {
                    key: lease.key().to_string(),
                });
            }
            thread::sleep(RESET_RETRY_INTERVAL);
        }
    }
}
