//! Key-value store contract shared by pause control and buffered counters.

use std::sync::Arc;
use std::time::Duration;

use crate::error::StoreError;
use crate::script::Script;

/// Shared handle to a store; every component holds one of these.
pub type SharedStore = Arc<dyn KeyValueStore>;

/// Inclusive score range for sorted-set reads and removals.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScoreRange {
    pub min: i64,
    pub max: i64,
}

impl ScoreRange {
    /// `-inf..=+inf`.
    pub fn all() -> Self {
        Self {
            min: i64::MIN,
            max: i64::MAX,
        }
    }

    pub fn between(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    pub fn up_to(max: i64) -> Self {
        Self { min: i64::MIN, max }
    }

    pub fn contains(&self, score: i64) -> bool {
        self.min <= score && score <= self.max
    }
}

/// Key-value store contract.
///
/// Implementations must make every method atomic with respect to every other
/// call on the same key. Multi-key methods (`incr_by_many`, `del`, `exists_many`)
/// are pipelines: each element is atomic, the batch as a whole need not be.
/// [KeyValueStore::eval] runs a [Script] as a single indivisible unit.
///
/// Keys holding strings and keys holding sorted sets live in one namespace;
/// using a key as the other kind fails with [StoreError::WrongType].
pub trait KeyValueStore: Send + Sync {
    /// Value of a string key, `None` when missing or expired.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Unconditionally set a string key, replacing any previous TTL.
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Set a string key only if absent. Returns true when the key was written.
    fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Remaining time to live; `None` when the key is missing or has no TTL.
    fn pttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Add `delta` to an integer key (missing keys count as 0). Returns the new value.
    fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError>;

    /// Pipelined `incr_by`; results are returned in input order.
    fn incr_by_many(&self, increments: &[(String, i64)]) -> Result<Vec<i64>, StoreError> {
        increments
            .iter()
            .map(|(key, delta)| self.incr_by(key, *delta))
            .collect()
    }

    /// Delete keys of any kind. Returns how many existed.
    fn del(&self, keys: &[&str]) -> Result<u64, StoreError>;

    fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Multi-key existence check; results are returned in input order.
    fn exists_many(&self, keys: &[String]) -> Result<Vec<bool>, StoreError> {
        keys.iter().map(|key| self.exists(key)).collect()
    }

    /// Add or re-score a member. Returns true when the member is new.
    fn zadd(&self, key: &str, score: i64, member: &str) -> Result<bool, StoreError>;

    /// Number of members; 0 for a missing key.
    fn zcard(&self, key: &str) -> Result<u64, StoreError>;

    /// Members with scores inside `range`, lowest score first (ties by member), at most `limit`.
    fn zrange_by_score(
        &self,
        key: &str,
        range: ScoreRange,
        limit: usize,
    ) -> Result<Vec<(String, i64)>, StoreError>;

    /// Remove every member whose score lies inside `range`. Returns the number removed.
    /// The key disappears once its last member is removed.
    fn zrem_range_by_score(&self, key: &str, range: ScoreRange) -> Result<u64, StoreError>;

    /// Remove one member. Returns true when it was present.
    fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Run an atomic script.
    fn eval(&self, script: &Script) -> Result<i64, StoreError>;

    /// Drop every expired key, including ones nobody reads again (stale leases,
    /// flush markers of idle counters). Returns how many were removed.
    fn purge_expired(&self) -> Result<u64, StoreError>;
}

pub(crate) fn parse_integer(key: &str, raw: Option<&str>) -> Result<i64, StoreError> {
    match raw {
        None => Ok(0),
        Some(raw) => raw
            .trim()
            .parse::<i64>()
            .map_err(|_| StoreError::NotAnInteger(key.to_string())),
    }
}

pub(crate) fn checked_add(key: &str, current: i64, delta: i64) -> Result<i64, StoreError> {
    current
        .checked_add(delta)
        .ok_or_else(|| StoreError::NotAnInteger(key.to_string()))
}
