#![cfg(feature = "sqlite-persistence")]

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::error::CounterError;
use crate::record::FlushTarget;
use crate::repository::{BeforeCommit, CounterRepository};

fn map_counter_err(prefix: &str, err: impl std::fmt::Display) -> CounterError {
    CounterError::Repository(format!("{prefix}: {err}"))
}

/// Durable counters in a SQLite table, one row per (record, attribute).
#[derive(Clone)]
pub struct SqliteCounterRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCounterRepository {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, CounterError> {
        let conn = Connection::open(db_path).map_err(|e| map_counter_err("open sqlite counters", e))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| map_counter_err("set journal_mode", e))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| map_counter_err("set busy_timeout", e))?;
        let repo = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        repo.ensure_schema()?;
        Ok(repo)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, CounterError> {
        self.conn
            .lock()
            .map_err(|_| CounterError::Repository("sqlite counters lock poisoned".into()))
    }

    fn ensure_schema(&self) -> Result<(), CounterError> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS counter_values (
              record_type TEXT NOT NULL,
              record_id INTEGER NOT NULL,
              project_id INTEGER NOT NULL,
              attribute TEXT NOT NULL,
              value INTEGER NOT NULL DEFAULT 0,
              updated_at_ms INTEGER NOT NULL,
              PRIMARY KEY (record_type, record_id, attribute)
            );
            CREATE INDEX IF NOT EXISTS idx_counter_values_project ON counter_values(project_id);
            "#,
        )
        .map_err(|e| map_counter_err("init sqlite counters schema", e))?;
        Ok(())
    }

    fn transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, CounterError>,
    ) -> Result<T, CounterError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .map_err(|e| map_counter_err("begin tx", e))?;
        let out = f(&tx)?;
        tx.commit().map_err(|e| map_counter_err("commit tx", e))?;
        Ok(out)
    }
}

fn read_value(tx: &Transaction<'_>, target: &FlushTarget) -> Result<i64, CounterError> {
    let value: Option<i64> = tx
        .query_row(
            "SELECT value FROM counter_values WHERE record_type = ?1 AND record_id = ?2 AND attribute = ?3",
            params![target.record.record_type, target.record.record_id, target.attribute],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| map_counter_err("read counter", e))?;
    Ok(value.unwrap_or(0))
}

fn write_value(tx: &Transaction<'_>, target: &FlushTarget, value: i64) -> Result<(), CounterError> {
    tx.execute(
        "INSERT INTO counter_values (record_type, record_id, project_id, attribute, value, updated_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(record_type, record_id, attribute)
         DO UPDATE SET value = excluded.value, updated_at_ms = excluded.updated_at_ms",
        params![
            target.record.record_type,
            target.record.record_id,
            target.record.project_id,
            target.attribute,
            value,
            Utc::now().timestamp_millis()
        ],
    )
    .map_err(|e| map_counter_err("write counter", e))?;
    Ok(())
}

fn add_value(tx: &Transaction<'_>, target: &FlushTarget, amount: i64) -> Result<i64, CounterError> {
    let next = read_value(tx, target)?
        .checked_add(amount)
        .ok_or_else(|| CounterError::Repository(format!("counter overflow on {}", target.key())))?;
    write_value(tx, target, next)?;
    Ok(next)
}

impl CounterRepository for SqliteCounterRepository {
    fn read(&self, target: &FlushTarget) -> Result<i64, CounterError> {
        self.transaction(|tx| read_value(tx, target))
    }

    fn increment(&self, target: &FlushTarget, amount: i64) -> Result<i64, CounterError> {
        self.transaction(|tx| add_value(tx, target, amount))
    }

    fn increment_in_transaction(
        &self,
        target: &FlushTarget,
        amount: i64,
        before_commit: BeforeCommit<'_>,
    ) -> Result<i64, CounterError> {
        self.transaction(|tx| {
            let value = add_value(tx, target, amount)?;
            before_commit()?;
            Ok(value)
        })
    }

    fn reset(&self, target: &FlushTarget) -> Result<(), CounterError> {
        self.transaction(|tx| write_value(tx, target, 0))
    }
}
