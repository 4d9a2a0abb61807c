use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::record::FlushTarget;

/// Invoked with the counter and its committed durable value.
pub type CounterCallback = Arc<dyn Fn(&FlushTarget, i64) + Send + Sync>;

/// After-commit "counter changed" callbacks, keyed by record type.
#[derive(Clone, Default)]
pub struct CounterCallbacks {
    by_record_type: BTreeMap<String, Vec<CounterCallback>>,
}

impl CounterCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, record_type: impl Into<String>, callback: CounterCallback) {
        self.by_record_type
            .entry(record_type.into())
            .or_default()
            .push(callback);
    }

    /// Run after the durable commit has landed, never inside it.
    pub fn fire(&self, target: &FlushTarget, value: i64) {
        if let Some(callbacks) = self.by_record_type.get(&target.record.record_type) {
            for callback in callbacks {
                callback(target, value);
            }
        }
    }
}

impl fmt::Debug for CounterCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: BTreeMap<&str, usize> = self
            .by_record_type
            .iter()
            .map(|(record_type, callbacks)| (record_type.as_str(), callbacks.len()))
            .collect();
        f.debug_struct("CounterCallbacks")
            .field("by_record_type", &counts)
            .finish()
    }
}
