//! In-memory key-value store.
//!
//! One mutex guards the whole keyspace, so every command and every script is
//! trivially atomic. Expired keys are dropped lazily when touched.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::{expiry_after, Clock, SystemClock};
use crate::error::StoreError;
use crate::script::{run_script, Script, ScriptHost};
use crate::store::{checked_add, parse_integer, KeyValueStore, ScoreRange};

#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: i64) -> bool {
        let previous = self.scores.insert(member.to_string(), score);
        if let Some(old) = previous {
            self.ordered.remove(&(old, member.to_string()));
        }
        self.ordered.insert((score, member.to_string()));
        previous.is_none()
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(score, member.to_string()));
                true
            }
            None => false,
        }
    }

    fn in_range(&self, range: ScoreRange) -> impl Iterator<Item = &(i64, String)> {
        self.ordered
            .range((range.min, String::new())..)
            .take_while(move |(score, _)| *score <= range.max)
    }

    fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

#[derive(Debug)]
enum Value {
    Text(String),
    Sorted(SortedSet),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
}

impl Keyspace {
    fn live(&mut self, key: &str, now: DateTime<Utc>) -> Option<&mut Entry> {
        let expired = self
            .entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get_mut(key)
    }

    fn text(&mut self, key: &str, now: DateTime<Utc>) -> Result<Option<String>, StoreError> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Entry {
                value: Value::Text(text),
                ..
            }) => Ok(Some(text.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn sorted(&mut self, key: &str, now: DateTime<Utc>) -> Result<Option<&mut SortedSet>, StoreError> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Entry {
                value: Value::Sorted(set),
                ..
            }) => Ok(Some(set)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn incr_by(&mut self, key: &str, delta: i64, now: DateTime<Utc>) -> Result<i64, StoreError> {
        let current = parse_integer(key, self.text(key, now)?.as_deref())?;
        let next = checked_add(key, current, delta)?;
        let expires_at = self.live(key, now).and_then(|entry| entry.expires_at);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(next.to_string()),
                expires_at,
            },
        );
        Ok(next)
    }

    fn zadd(&mut self, key: &str, score: i64, member: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        if let Some(set) = self.sorted(key, now)? {
            return Ok(set.insert(member, score));
        }
        let mut set = SortedSet::default();
        set.insert(member, score);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Sorted(set),
                expires_at: None,
            },
        );
        Ok(true)
    }

    fn zcard(&mut self, key: &str, now: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(self.sorted(key, now)?.map_or(0, |set| set.scores.len() as u64))
    }

    fn remove(&mut self, key: &str, now: DateTime<Utc>) -> bool {
        self.live(key, now).is_some() && self.entries.remove(key).is_some()
    }
}

struct LockedScriptHost<'a> {
    keyspace: &'a mut Keyspace,
    now: DateTime<Utc>,
}

impl ScriptHost for LockedScriptHost<'_> {
    fn get(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        self.keyspace.text(key, self.now)
    }

    fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.keyspace.incr_by(key, delta, self.now)
    }

    fn del(&mut self, key: &str) -> Result<bool, StoreError> {
        Ok(self.keyspace.remove(key, self.now))
    }

    fn zadd(&mut self, key: &str, score: i64, member: &str) -> Result<bool, StoreError> {
        self.keyspace.zadd(key, score, member, self.now)
    }

    fn zcard(&mut self, key: &str) -> Result<u64, StoreError> {
        self.keyspace.zcard(key, self.now)
    }
}

/// Process-local store, used in tests and single-process deployments.
pub struct InMemoryKeyValueStore {
    keyspace: Mutex<Keyspace>,
    clock: Arc<dyn Clock>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            keyspace: Mutex::new(Keyspace::default()),
            clock,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Keyspace>, StoreError> {
        self.keyspace.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Number of live keys (expired ones are not counted).
    pub fn len(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let keyspace = self.lock()?;
        Ok(keyspace
            .entries
            .values()
            .filter(|entry| entry.expires_at.map_or(true, |at| at > now))
            .count())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

impl Default for InMemoryKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now();
        self.lock()?.text(key, now)
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let now = self.clock.now();
        self.lock()?.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: ttl.map(|ttl| expiry_after(now, ttl)),
            },
        );
        Ok(())
    }

    fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut keyspace = self.lock()?;
        if keyspace.live(key, now).is_some() {
            return Ok(false);
        }
        keyspace.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: Some(expiry_after(now, ttl)),
            },
        );
        Ok(true)
    }

    fn pttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let now = self.clock.now();
        let mut keyspace = self.lock()?;
        Ok(keyspace
            .live(key, now)
            .and_then(|entry| entry.expires_at)
            .and_then(|at| (at - now).to_std().ok()))
    }

    fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let now = self.clock.now();
        self.lock()?.incr_by(key, delta, now)
    }

    fn incr_by_many(&self, increments: &[(String, i64)]) -> Result<Vec<i64>, StoreError> {
        let now = self.clock.now();
        let mut keyspace = self.lock()?;
        increments
            .iter()
            .map(|(key, delta)| keyspace.incr_by(key, *delta, now))
            .collect()
    }

    fn del(&self, keys: &[&str]) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let mut keyspace = self.lock()?;
        Ok(keys.iter().filter(|key| keyspace.remove(key, now)).count() as u64)
    }

    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        Ok(self.lock()?.live(key, now).is_some())
    }

    fn exists_many(&self, keys: &[String]) -> Result<Vec<bool>, StoreError> {
        let now = self.clock.now();
        let mut keyspace = self.lock()?;
        Ok(keys
            .iter()
            .map(|key| keyspace.live(key, now).is_some())
            .collect())
    }

    fn zadd(&self, key: &str, score: i64, member: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        self.lock()?.zadd(key, score, member, now)
    }

    fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let now = self.clock.now();
        self.lock()?.zcard(key, now)
    }

    fn zrange_by_score(
        &self,
        key: &str,
        range: ScoreRange,
        limit: usize,
    ) -> Result<Vec<(String, i64)>, StoreError> {
        let now = self.clock.now();
        let mut keyspace = self.lock()?;
        Ok(match keyspace.sorted(key, now)? {
            None => Vec::new(),
            Some(set) => set
                .in_range(range)
                .take(limit)
                .map(|(score, member)| (member.clone(), *score))
                .collect(),
        })
    }

    fn zrem_range_by_score(&self, key: &str, range: ScoreRange) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let mut keyspace = self.lock()?;
        let Some(set) = keyspace.sorted(key, now)? else {
            return Ok(0);
        };
        let doomed: Vec<String> = set.in_range(range).map(|(_, member)| member.clone()).collect();
        for member in &doomed {
            set.remove(member);
        }
        if set.is_empty() {
            keyspace.entries.remove(key);
        }
        Ok(doomed.len() as u64)
    }

    fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut keyspace = self.lock()?;
        let Some(set) = keyspace.sorted(key, now)? else {
            return Ok(false);
        };
        let removed = set.remove(member);
        if set.is_empty() {
            keyspace.entries.remove(key);
        }
        Ok(removed)
    }

    fn eval(&self, script: &Script) -> Result<i64, StoreError> {
        let now = self.clock.now();
        let mut keyspace = self.lock()?;
        let mut host = LockedScriptHost {
            keyspace: &mut keyspace,
            now,
        };
        run_script(&mut host, script)
    }

    fn purge_expired(&self) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let mut keyspace = self.lock()?;
        let before = keyspace.entries.len();
        keyspace
            .entries
            .retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));
        Ok((before - keyspace.entries.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::clock::ManualClock;

    fn store_with_clock() -> (InMemoryKeyValueStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (InMemoryKeyValueStore::with_clock(clock.clone()), clock)
    }

    #[test]
    fn incr_by_starts_from_zero_and_accumulates() {
        let store = InMemoryKeyValueStore::new();
        assert_eq!(store.incr_by("c", 3).expect("incr"), 3);
        assert_eq!(store.incr_by("c", -5).expect("incr"), -2);
        assert_eq!(store.get("c").expect("get").as_deref(), Some("-2"));
    }

    #[test]
    fn incr_by_rejects_non_integer_value() {
        let store = InMemoryKeyValueStore::new();
        store.set("c", "abc", None).expect("set");
        assert!(matches!(store.incr_by("c", 1), Err(StoreError::NotAnInteger(_))));
    }

    #[test]
    fn incr_by_many_returns_running_totals_in_order() {
        let store = InMemoryKeyValueStore::new();
        let totals = store
            .incr_by_many(&[("a".into(), 1), ("a".into(), 2), ("b".into(), 5)])
            .expect("pipeline");
        assert_eq!(totals, vec![1, 3, 5]);
    }

    #[test]
    fn set_nx_only_writes_absent_keys_and_expires() {
        let (store, clock) = store_with_clock();
        assert!(store.set_nx("lock", "a", Duration::from_secs(10)).expect("first"));
        assert!(!store.set_nx("lock", "b", Duration::from_secs(10)).expect("second"));
        assert_eq!(store.pttl("lock").expect("pttl"), Some(Duration::from_secs(10)));

        clock.advance(ChronoDuration::seconds(10));

        assert!(!store.exists("lock").expect("exists"));
        assert!(store.set_nx("lock", "b", Duration::from_secs(10)).expect("after expiry"));
        assert_eq!(store.get("lock").expect("get").as_deref(), Some("b"));
    }

    #[test]
    fn incr_by_keeps_existing_ttl() {
        let (store, clock) = store_with_clock();
        store.set("c", "1", Some(Duration::from_secs(5))).expect("set");
        store.incr_by("c", 1).expect("incr");
        clock.advance(ChronoDuration::seconds(6));
        assert_eq!(store.get("c").expect("get"), None);
    }

    #[test]
    fn sorted_set_orders_by_score_and_limits() {
        let store = InMemoryKeyValueStore::new();
        store.zadd("z", 3, "c").expect("zadd");
        store.zadd("z", 1, "a").expect("zadd");
        store.zadd("z", 2, "b").expect("zadd");

        let first_two = store.zrange_by_score("z", ScoreRange::all(), 2).expect("range");
        assert_eq!(first_two, vec![("a".to_string(), 1), ("b".to_string(), 2)]);
        assert_eq!(store.zcard("z").expect("zcard"), 3);
    }

    #[test]
    fn zadd_rescores_existing_member() {
        let store = InMemoryKeyValueStore::new();
        assert!(store.zadd("z", 1, "a").expect("zadd"));
        assert!(!store.zadd("z", 9, "a").expect("rescore"));
        assert_eq!(
            store.zrange_by_score("z", ScoreRange::all(), 10).expect("range"),
            vec![("a".to_string(), 9)]
        );
    }

    #[test]
    fn zrem_range_by_score_drops_empty_key() {
        let store = InMemoryKeyValueStore::new();
        store.zadd("z", 1, "a").expect("zadd");
        store.zadd("z", 2, "b").expect("zadd");
        store.zadd("z", 3, "c").expect("zadd");

        assert_eq!(store.zrem_range_by_score("z", ScoreRange::between(1, 2)).expect("rem"), 2);
        assert_eq!(store.zcard("z").expect("zcard"), 1);
        assert!(store.zrem("z", "c").expect("zrem"));
        assert!(!store.exists("z").expect("exists"));
    }

    #[test]
    fn string_and_sorted_set_commands_do_not_mix() {
        let store = InMemoryKeyValueStore::new();
        store.zadd("z", 1, "a").expect("zadd");
        assert!(matches!(store.incr_by("z", 1), Err(StoreError::WrongType(_))));
        store.set("s", "1", None).expect("set");
        assert!(matches!(store.zadd("s", 1, "a"), Err(StoreError::WrongType(_))));
    }

    #[test]
    fn del_counts_only_live_keys() {
        let store = InMemoryKeyValueStore::new();
        store.set("a", "1", None).expect("set");
        store.zadd("b", 1, "m").expect("zadd");
        assert_eq!(store.del(&["a", "b", "missing"]).expect("del"), 2);
        assert!(store.is_empty().expect("empty"));
    }

    #[test]
    fn exists_many_preserves_order() {
        let store = InMemoryKeyValueStore::new();
        store.set("b", "1", None).expect("set");
        let found = store
            .exists_many(&["a".into(), "b".into(), "c".into()])
            .expect("exists_many");
        assert_eq!(found, vec![false, true, false]);
    }

    #[test]
    fn eval_flush_increment_is_applied_under_one_lock() {
        let store = InMemoryKeyValueStore::new();
        store.incr_by("inc", 4).expect("incr");
        let script = Script::FlushIncrement {
            increment_key: "inc".into(),
            flushed_key: "inc:flushed".into(),
        };
        assert_eq!(store.eval(&script).expect("eval"), 4);
        assert_eq!(store.get("inc").expect("get"), None);
        assert_eq!(store.get("inc:flushed").expect("get").as_deref(), Some("4"));
    }

    #[test]
    fn purge_expired_drops_keys_nobody_touches_again() {
        let (store, clock) = store_with_clock();
        for i in 0..50 {
            store
                .set_nx(&format!("marker:{i}:flush-scheduled"), "1", Duration::from_secs(600))
                .expect("set_nx");
        }
        store.set("durable", "1", None).expect("set");
        store.zadd("z", 1, "a").expect("zadd");

        assert_eq!(store.purge_expired().expect("purge"), 0);
        clock.advance(ChronoDuration::days(30));

        assert_eq!(store.purge_expired().expect("purge"), 50);
        assert_eq!(store.keyspace.lock().expect("lock").entries.len(), 2);
    }

    #[test]
    fn scored_insert_and_drop_share_the_keyspace_lock() {
        let store = InMemoryKeyValueStore::new();
        let insert = Script::ScoredInsert {
            set_key: "q:{w}".into(),
            score_key: "s:{w}".into(),
            member: "job".into(),
        };
        assert_eq!(store.eval(&insert).expect("insert"), 1);

        let drop_script = Script::DropWhenEmpty {
            set_key: "q:{w}".into(),
            score_key: "s:{w}".into(),
        };
        assert_eq!(store.eval(&drop_script).expect("drop"), 1);
        store.zrem("q:{w}", "job").expect("zrem");
        assert_eq!(store.eval(&drop_script).expect("drop"), 0);
        assert!(!store.exists("s:{w}").expect("exists"));
    }
}
