use std::sync::Arc;

use crate::backend::CounterBackend;
use crate::counter::Counter;
use crate::error::CounterError;
use crate::record::FlushTarget;

/// Writes every increment straight to the durable repository. Nothing is
/// staged, so [Counter::get] is always 0.
#[derive(Clone)]
pub struct LegacyCounter {
    backend: Arc<CounterBackend>,
    target: FlushTarget,
}

impl LegacyCounter {
    pub(crate) fn new(backend: Arc<CounterBackend>, target: FlushTarget) -> Self {
        Self { backend, target }
    }
}

impl Counter for LegacyCounter {
    fn target(&self) -> &FlushTarget {
        &self.target
    }

    fn increment(&self, amount: i64) -> Result<i64, CounterError> {
        let value = self.backend.repository().increment(&self.target, amount)?;
        self.backend.callbacks().fire(&self.target, value);
        Ok(value)
    }

    fn bulk_increment(&self, amounts: &[i64]) -> Result<i64, CounterError> {
        let total = amounts
            .iter()
            .try_fold(0i64, |total, amount| total.checked_add(*amount))
            .ok_or_else(|| {
                CounterError::Repository(format!("counter overflow on {}", self.target.key()))
            })?;
        self.increment(total)
    }

    fn get(&self) -> Result<i64, CounterError> {
        Ok(0)
    }

    fn reset(&self) -> Result<(), CounterError> {
        self.backend.repository().reset(&self.target)?;
        self.backend.callbacks().fire(&self.target, 0);
        Ok(())
    }
}
