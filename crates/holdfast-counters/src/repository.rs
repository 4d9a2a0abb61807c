//! Durable counter storage: the source of truth that buffered deltas are
//! eventually committed to.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::CounterError;
use crate::record::FlushTarget;

/// Hook run inside a durable transaction, after the update and before commit.
/// An error rolls the transaction back.
pub type BeforeCommit<'a> = &'a dyn Fn() -> Result<(), CounterError>;

pub trait CounterRepository: Send + Sync {
    /// Current durable value; counters never written read as 0.
    fn read(&self, target: &FlushTarget) -> Result<i64, CounterError>;

    /// Native atomic increment. Returns the new value.
    fn increment(&self, target: &FlushTarget, amount: i64) -> Result<i64, CounterError>;

    /// Add `amount` and run `before_commit` in one transaction. Returns the
    /// committed value.
    fn increment_in_transaction(
        &self,
        target: &FlushTarget,
        amount: i64,
        before_commit: BeforeCommit<'_>,
    ) -> Result<i64, CounterError>;

    fn reset(&self, target: &FlushTarget) -> Result<(), CounterError>;
}

fn checked_add(target: &FlushTarget, current: i64, amount: i64) -> Result<i64, CounterError> {
    current
        .checked_add(amount)
        .ok_or_else(|| CounterError::Repository(format!("counter overflow on {}", target.key())))
}

#[derive(Debug, Default)]
pub struct InMemoryCounterRepository {
    values: Mutex<HashMap<FlushTarget, i64>>,
}

impl InMemoryCounterRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<FlushTarget, i64>>, CounterError> {
        self.values
            .lock()
            .map_err(|_| CounterError::Repository("counter repository lock poisoned".into()))
    }
}

impl CounterRepository for InMemoryCounterRepository {
    fn read(&self, target: &FlushTarget) -> Result<i64, CounterError> {
        Ok(self.lock()?.get(target).copied().unwrap_or(0))
    }

    fn increment(&self, target: &FlushTarget, amount: i64) -> Result<i64, CounterError> {
        let mut values = self.lock()?;
        let next = checked_add(target, values.get(target).copied().unwrap_or(0), amount)?;
        values.insert(target.clone(), next);
        Ok(next)
    }

    fn increment_in_transaction(
        &self,
        target: &FlushTarget,
        amount: i64,
        before_commit: BeforeCommit<'_>,
    ) -> Result<i64, CounterError> {
        // Holding the lock across the hook keeps the update invisible until it lands.
        let mut values = self.lock()?;
        let next = checked_add(target, values.get(target).copied().unwrap_or(0), amount)?;
        before_commit()?;
        values.insert(target.clone(), next);
        Ok(next)
    }

    fn reset(&self, target: &FlushTarget) -> Result<(), CounterError> {
        self.lock()?.insert(target.clone(), 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::CounterRecord;

    fn target() -> FlushTarget {
        FlushTarget::new(CounterRecord::new(1, "ProjectStatistics", 1), "storage_size")
    }

    #[test]
    fn failed_hook_leaves_value_untouched() {
        let repo = InMemoryCounterRepository::new();
        repo.increment(&target(), 5).expect("increment");

        let result = repo.increment_in_transaction(&target(), 3, &|| {
            Err(CounterError::Repository("hook failed".into()))
        });

        assert!(result.is_err());
        assert_eq!(repo.read(&target()).expect("read"), 5);
    }

    #[test]
    fn transaction_commits_after_hook() {
        let repo = InMemoryCounterRepository::new();
        let value = repo
            .increment_in_transaction(&target(), 3, &|| Ok(()))
            .expect("commit");
        assert_eq!(value, 3);
        repo.reset(&target()).expect("reset");
        assert_eq!(repo.read(&target()).expect("read"), 0);
    }
}
