use crate::error::CounterError;
use crate::record::FlushTarget;

/// What callers of a counted attribute see, whichever way it is backed.
pub trait Counter: Send + Sync {
    fn target(&self) -> &FlushTarget;

    /// Add `amount`; returns the running total the backing store now holds.
    fn increment(&self, amount: i64) -> Result<i64, CounterError>;

    /// Apply several deltas in one round trip; returns the final running total.
    fn bulk_increment(&self, amounts: &[i64]) -> Result<i64, CounterError>;

    /// Amount accepted but not yet reflected in the durable value.
    fn get(&self) -> Result<i64, CounterError>;

    /// Zero the durable value and drop anything pending. Meant for
    /// recomputation and backfills.
    fn reset(&self) -> Result<(), CounterError>;
}
