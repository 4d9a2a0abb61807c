//! Atomic multi-step scripts.
//!
//! A [Script] names a fixed sequence of reads and writes that a store must run
//! without any other command interleaving. Stores provide a [ScriptHost] view of
//! their locked state (a mutex guard, an open transaction) and hand it to
//! [run_script], so every backend executes the same steps.

use crate::error::StoreError;

/// Scripts understood by every [crate::KeyValueStore].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Script {
    /// Move the pending counter delta into the staging key.
    ///
    /// Reads `increment_key`, adds it into `flushed_key`, deletes `increment_key`,
    /// and also deletes `flushed_key` when the staged total is exactly zero.
    /// Returns the staged total.
    FlushIncrement {
        increment_key: String,
        flushed_key: String,
    },
    /// Delete `key` only while it still holds `expected`. Returns 1 when deleted.
    CompareAndDelete { key: String, expected: String },
    /// Allocate the next score from `score_key` and add `member` to `set_key` with it.
    ///
    /// Allocation and insert happen together, so a concurrent [Script::DropWhenEmpty]
    /// can never reset the score counter between them. Returns the allocated score.
    ScoredInsert {
        set_key: String,
        score_key: String,
        member: String,
    },
    /// Delete both `set_key` and `score_key` if the set has no members.
    /// Returns the set's cardinality (0 when the keys were dropped).
    DropWhenEmpty { set_key: String, score_key: String },
}

impl Script {
    pub fn name(&self) -> &'static str {
        match self {
            Script::FlushIncrement { .. } => "flush_increment",
            Script::CompareAndDelete { .. } => "compare_and_delete",
            Script::ScoredInsert { .. } => "scored_insert",
            Script::DropWhenEmpty { .. } => "drop_when_empty",
        }
    }

    /// Every key the script touches; sharded stores require them to share a slot.
    pub fn keys(&self) -> Vec<&str> {
        match self {
            Script::FlushIncrement {
                increment_key,
                flushed_key,
            } => vec![increment_key.as_str(), flushed_key.as_str()],
            Script::CompareAndDelete { key, .. } => vec![key.as_str()],
            Script::ScoredInsert {
                set_key, score_key, ..
            }
            | Script::DropWhenEmpty { set_key, score_key } => {
                vec![set_key.as_str(), score_key.as_str()]
            }
        }
    }
}

/// Primitives a store exposes while it holds its script lock.
pub trait ScriptHost {
    fn get(&mut self, key: &str) -> Result<Option<String>, StoreError>;
    fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64, StoreError>;
    fn del(&mut self, key: &str) -> Result<bool, StoreError>;
    fn zadd(&mut self, key: &str, score: i64, member: &str) -> Result<bool, StoreError>;
    fn zcard(&mut self, key: &str) -> Result<u64, StoreError>;
}

/// Execute `script` against a locked store view.
pub fn run_script<H: ScriptHost + ?Sized>(host: &mut H, script: &Script) -> Result<i64, StoreError> {
    match script {
        Script::FlushIncrement {
            increment_key,
            flushed_key,
        } => {
            let pending = crate::store::parse_integer(increment_key, host.get(increment_key)?.as_deref())?;
            let flushed = host.incr_by(flushed_key, pending)?;
            host.del(increment_key)?;
            if flushed == 0 {
                host.del(flushed_key)?;
            }
            Ok(flushed)
        }
        Script::CompareAndDelete { key, expected } => {
            if host.get(key)?.as_deref() == Some(expected.as_str()) {
                host.del(key)?;
                Ok(1)
            } else {
                Ok(0)
            }
        }
        Script::ScoredInsert {
            set_key,
            score_key,
            member,
        } => {
            let score = host.incr_by(score_key, 1)?;
            host.zadd(set_key, score, member)?;
            Ok(score)
        }
        Script::DropWhenEmpty { set_key, score_key } => {
            let size = host.zcard(set_key)?;
            if size == 0 {
                host.del(set_key)?;
                host.del(score_key)?;
            }
            Ok(i64::try_from(size).unwrap_or(i64::MAX))
        }
    }
}
