//! Identity of a counted attribute and the store keys derived from it.

use serde::{Deserialize, Serialize};

/// A row that owns counter attributes, e.g. a project's statistics record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CounterRecord {
    pub project_id: i64,
    pub record_type: String,
    pub record_id: i64,
}

impl CounterRecord {
    pub fn new(project_id: i64, record_type: impl Into<String>, record_id: i64) -> Self {
        Self {
            project_id,
            record_type: record_type.into(),
            record_id,
        }
    }
}

/// One counter: a record plus the attribute being counted.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlushTarget {
    pub record: CounterRecord,
    pub attribute: String,
}

impl FlushTarget {
    pub fn new(record: CounterRecord, attribute: impl Into<String>) -> Self {
        Self {
            record,
            attribute: attribute.into(),
        }
    }

    /// Unflushed delta. The project id is a hash tag, so every key of a
    /// project's counters lands on the same shard.
    pub fn key(&self) -> String {
        format!(
            "project:{{{}}}:counters:{}:{}:{}",
            self.record.project_id, self.record.record_type, self.record.record_id, self.attribute
        )
    }

    /// Delta captured by a flush but not yet durably committed.
    pub fn flushed_key(&self) -> String {
        format!("{}:flushed", self.key())
    }

    pub fn lease_key(&self) -> String {
        format!("{}:locked", self.key())
    }

    pub fn schedule_marker_key(&self) -> String {
        format!("{}:flush-scheduled", self.key())
    }
}
