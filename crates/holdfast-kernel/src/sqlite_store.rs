//! SQLite-backed key-value store.
//!
//! Lets several processes on one host share waiting queues, counters and leases
//! through a single database file. Each command runs in its own transaction on a
//! connection guarded by a mutex; expired strings are purged lazily.

#![cfg(feature = "sqlite-persistence")]

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::clock::{expiry_after, Clock, SystemClock};
use crate::error::StoreError;
use crate::script::{run_script, Script, ScriptHost};
use crate::store::{checked_add, parse_integer, KeyValueStore, ScoreRange};

fn map_sqlite_err(prefix: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(format!("{prefix}: {err}"))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum KeyKind {
    Text,
    Sorted,
}

#[derive(Clone)]
pub struct SqliteKeyValueStore {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
}

impl SqliteKeyValueStore {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::with_clock(db_path, Arc::new(SystemClock))
    }

    pub fn with_clock(db_path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| map_sqlite_err("create parent dir", e))?;
        }
        let conn = Connection::open(db_path).map_err(|e| map_sqlite_err("open sqlite kv store", e))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| map_sqlite_err("set journal_mode", e))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| map_sqlite_err("set busy_timeout", e))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            clock,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv_strings (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL,
              expires_at_ms INTEGER NULL
            );
            CREATE TABLE IF NOT EXISTS kv_zsets (
              key TEXT NOT NULL,
              member TEXT NOT NULL,
              score INTEGER NOT NULL,
              PRIMARY KEY (key, member)
            );
            CREATE INDEX IF NOT EXISTS idx_kv_zsets_key_score ON kv_zsets(key, score, member);
            CREATE INDEX IF NOT EXISTS idx_kv_strings_expiry ON kv_strings(expires_at_ms);
            "#,
        )
        .map_err(|e| map_sqlite_err("init sqlite kv schema", e))?;
        Ok(())
    }

    /// Run `f` inside one write transaction.
    fn write<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>, i64) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let now_ms = dt_to_ms(self.clock.now());
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .map_err(|e| map_sqlite_err("begin tx", e))?;
        let out = f(&tx, now_ms)?;
        tx.commit().map_err(|e| map_sqlite_err("commit tx", e))?;
        Ok(out)
    }
}

fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn purge_key(tx: &Transaction<'_>, key: &str, now_ms: i64) -> Result<(), StoreError> {
    tx.execute(
        "DELETE FROM kv_strings WHERE key = ?1 AND expires_at_ms IS NOT NULL AND expires_at_ms <= ?2",
        params![key, now_ms],
    )
    .map_err(|e| map_sqlite_err("purge expired key", e))?;
    Ok(())
}

fn key_kind(tx: &Transaction<'_>, key: &str, now_ms: i64) -> Result<Option<KeyKind>, StoreError> {
    purge_key(tx, key, now_ms)?;
    let text: Option<i64> = tx
        .query_row("SELECT 1 FROM kv_strings WHERE key = ?1", params![key], |r| r.get(0))
        .optional()
        .map_err(|e| map_sqlite_err("probe string key", e))?;
    if text.is_some() {
        return Ok(Some(KeyKind::Text));
    }
    let sorted: Option<i64> = tx
        .query_row("SELECT 1 FROM kv_zsets WHERE key = ?1 LIMIT 1", params![key], |r| r.get(0))
        .optional()
        .map_err(|e| map_sqlite_err("probe zset key", e))?;
    Ok(sorted.map(|_| KeyKind::Sorted))
}

fn expect_kind(tx: &Transaction<'_>, key: &str, now_ms: i64, wanted: KeyKind) -> Result<bool, StoreError> {
    match key_kind(tx, key, now_ms)? {
        None => Ok(false),
        Some(kind) if kind == wanted => Ok(true),
        Some(_) => Err(StoreError::WrongType(key.to_string())),
    }
}

fn read_text(tx: &Transaction<'_>, key: &str, now_ms: i64) -> Result<Option<String>, StoreError> {
    if !expect_kind(tx, key, now_ms, KeyKind::Text)? {
        return Ok(None);
    }
    tx.query_row("SELECT value FROM kv_strings WHERE key = ?1", params![key], |r| r.get(0))
        .optional()
        .map_err(|e| map_sqlite_err("read string", e))
}

fn incr_text(tx: &Transaction<'_>, key: &str, delta: i64, now_ms: i64) -> Result<i64, StoreError> {
    let current = parse_integer(key, read_text(tx, key, now_ms)?.as_deref())?;
    let next = checked_add(key, current, delta)?;
    tx.execute(
        "INSERT INTO kv_strings (key, value, expires_at_ms) VALUES (?1, ?2, NULL)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, next.to_string()],
    )
    .map_err(|e| map_sqlite_err("incr string", e))?;
    Ok(next)
}

fn delete_key(tx: &Transaction<'_>, key: &str, now_ms: i64) -> Result<bool, StoreError> {
    purge_key(tx, key, now_ms)?;
    let strings = tx
        .execute("DELETE FROM kv_strings WHERE key = ?1", params![key])
        .map_err(|e| map_sqlite_err("delete string", e))?;
    let members = tx
        .execute("DELETE FROM kv_zsets WHERE key = ?1", params![key])
        .map_err(|e| map_sqlite_err("delete zset", e))?;
    Ok(strings + members > 0)
}

fn zadd_member(
    tx: &Transaction<'_>,
    key: &str,
    score: i64,
    member: &str,
    now_ms: i64,
) -> Result<bool, StoreError> {
    expect_kind(tx, key, now_ms, KeyKind::Sorted)?;
    let existing: Option<i64> = tx
        .query_row(
            "SELECT score FROM kv_zsets WHERE key = ?1 AND member = ?2",
            params![key, member],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| map_sqlite_err("probe zset member", e))?;
    tx.execute(
        "INSERT INTO kv_zsets (key, member, score) VALUES (?1, ?2, ?3)
         ON CONFLICT(key, member) DO UPDATE SET score = excluded.score",
        params![key, member, score],
    )
    .map_err(|e| map_sqlite_err("zadd", e))?;
    Ok(existing.is_none())
}

fn zset_len(tx: &Transaction<'_>, key: &str, now_ms: i64) -> Result<u64, StoreError> {
    if !expect_kind(tx, key, now_ms, KeyKind::Sorted)? {
        return Ok(0);
    }
    let count: i64 = tx
        .query_row("SELECT COUNT(*) FROM kv_zsets WHERE key = ?1", params![key], |r| r.get(0))
        .map_err(|e| map_sqlite_err("zcard", e))?;
    Ok(count as u64)
}

struct TransactionScriptHost<'a, 'conn> {
    tx: &'a Transaction<'conn>,
    now_ms: i64,
}

impl ScriptHost for TransactionScriptHost<'_, '_> {
    fn get(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        read_text(self.tx, key, self.now_ms)
    }

    fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64, StoreError> {
        incr_text(self.tx, key, delta, self.now_ms)
    }

    fn del(&mut self, key: &str) -> Result<bool, StoreError> {
        delete_key(self.tx, key, self.now_ms)
    }

    fn zadd(&mut self, key: &str, score: i64, member: &str) -> Result<bool, StoreError> {
        zadd_member(self.tx, key, score, member, self.now_ms)
    }

    fn zcard(&mut self, key: &str) -> Result<u64, StoreError> {
        zset_len(self.tx, key, self.now_ms)
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.write(|tx, now_ms| read_text(tx, key, now_ms))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let now = self.clock.now();
        let expires_at_ms = ttl.map(|ttl| dt_to_ms(expiry_after(now, ttl)));
        self.write(|tx, now_ms| {
            if key_kind(tx, key, now_ms)? == Some(KeyKind::Sorted) {
                delete_key(tx, key, now_ms)?;
            }
            tx.execute(
                "INSERT INTO kv_strings (key, value, expires_at_ms) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at_ms = excluded.expires_at_ms",
                params![key, value, expires_at_ms],
            )
            .map_err(|e| map_sqlite_err("set string", e))?;
            Ok(())
        })
    }

    fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let expires_at_ms = dt_to_ms(expiry_after(self.clock.now(), ttl));
        self.write(|tx, now_ms| {
            if key_kind(tx, key, now_ms)?.is_some() {
                return Ok(false);
            }
            tx.execute(
                "INSERT INTO kv_strings (key, value, expires_at_ms) VALUES (?1, ?2, ?3)",
                params![key, value, expires_at_ms],
            )
            .map_err(|e| map_sqlite_err("set_nx string", e))?;
            Ok(true)
        })
    }

    fn pttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        self.write(|tx, now_ms| {
            purge_key(tx, key, now_ms)?;
            let expires_at_ms: Option<Option<i64>> = tx
                .query_row(
                    "SELECT expires_at_ms FROM kv_strings WHERE key = ?1",
                    params![key],
                    |r| r.get(0),
                )
                .optional()
                .map_err(|e| map_sqlite_err("read ttl", e))?;
            Ok(expires_at_ms
                .flatten()
                .map(|at| Duration::from_millis(at.saturating_sub(now_ms).max(0) as u64)))
        })
    }

    fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.write(|tx, now_ms| incr_text(tx, key, delta, now_ms))
    }

    fn incr_by_many(&self, increments: &[(String, i64)]) -> Result<Vec<i64>, StoreError> {
        self.write(|tx, now_ms| {
            increments
                .iter()
                .map(|(key, delta)| incr_text(tx, key, *delta, now_ms))
                .collect()
        })
    }

    fn del(&self, keys: &[&str]) -> Result<u64, StoreError> {
        self.write(|tx, now_ms| {
            let mut removed = 0;
            for key in keys {
                if delete_key(tx, key, now_ms)? {
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.write(|tx, now_ms| Ok(key_kind(tx, key, now_ms)?.is_some()))
    }

    fn exists_many(&self, keys: &[String]) -> Result<Vec<bool>, StoreError> {
        self.write(|tx, now_ms| {
            keys.iter()
                .map(|key| -> Result<bool, StoreError> { Ok(key_kind(tx, key, now_ms)?.is_some()) })
                .collect()
        })
    }

    fn zadd(&self, key: &str, score: i64, member: &str) -> Result<bool, StoreError> {
        self.write(|tx, now_ms| zadd_member(tx, key, score, member, now_ms))
    }

    fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        self.write(|tx, now_ms| zset_len(tx, key, now_ms))
    }

    fn zrange_by_score(
        &self,
        key: &str,
        range: ScoreRange,
        limit: usize,
    ) -> Result<Vec<(String, i64)>, StoreError> {
        self.write(|tx, now_ms| {
            if !expect_kind(tx, key, now_ms, KeyKind::Sorted)? {
                return Ok(Vec::new());
            }
            let mut stmt = tx
                .prepare(
                    "SELECT member, score FROM kv_zsets
                     WHERE key = ?1 AND score >= ?2 AND score <= ?3
                     ORDER BY score ASC, member ASC
                     LIMIT ?4",
                )
                .map_err(|e| map_sqlite_err("prepare zrange", e))?;
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let rows = stmt
                .query_map(params![key, range.min, range.max, limit], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(|e| map_sqlite_err("query zrange", e))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(|e| map_sqlite_err("scan zrange", e))?);
            }
            Ok(out)
        })
    }

    fn zrem_range_by_score(&self, key: &str, range: ScoreRange) -> Result<u64, StoreError> {
        self.write(|tx, now_ms| {
            if !expect_kind(tx, key, now_ms, KeyKind::Sorted)? {
                return Ok(0);
            }
            let removed = tx
                .execute(
                    "DELETE FROM kv_zsets WHERE key = ?1 AND score >= ?2 AND score <= ?3",
                    params![key, range.min, range.max],
                )
                .map_err(|e| map_sqlite_err("zremrangebyscore", e))?;
            Ok(removed as u64)
        })
    }

    fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.write(|tx, now_ms| {
            if !expect_kind(tx, key, now_ms, KeyKind::Sorted)? {
                return Ok(false);
            }
            let removed = tx
                .execute(
                    "DELETE FROM kv_zsets WHERE key = ?1 AND member = ?2",
                    params![key, member],
                )
                .map_err(|e| map_sqlite_err("zrem", e))?;
            Ok(removed > 0)
        })
    }

    fn eval(&self, script: &Script) -> Result<i64, StoreError> {
        self.write(|tx, now_ms| {
            let mut host = TransactionScriptHost { tx, now_ms };
            run_script(&mut host, script)
        })
    }

    fn purge_expired(&self) -> Result<u64, StoreError> {
        self.write(|tx, now_ms| {
            let removed = tx
                .execute(
                    "DELETE FROM kv_strings WHERE expires_at_ms IS NOT NULL AND expires_at_ms <= ?1",
                    params![now_ms],
                )
                .map_err(|e| map_sqlite_err("purge expired", e))?;
            Ok(removed as u64)
        })
    }
}
