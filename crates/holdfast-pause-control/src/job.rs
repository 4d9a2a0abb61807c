//! Job payloads as they pass through the dispatch hooks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type JobArgs = Vec<Value>;
pub type JobContext = BTreeMap<String, String>;

/// One unit of work addressed to a worker class.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Job id; stays the same when a paused job is resubmitted.
    pub jid: String,
    pub worker: String,
    pub args: JobArgs,
    #[serde(default)]
    pub context: JobContext,
}

impl JobPayload {
    pub fn new(worker: impl Into<String>, args: JobArgs) -> Self {
        Self {
            jid: uuid::Uuid::new_v4().simple().to_string(),
            worker: worker.into(),
            args,
            context: JobContext::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Outcome of a dispatch hook.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Dispatch<T> {
    /// The continuation ran and produced `T`.
    Continued(T),
    /// The job was diverted to the waiting queue; the continuation never ran.
    Paused,
}

impl<T> Dispatch<T> {
    pub fn is_paused(&self) -> bool {
        matches!(self, Dispatch::Paused)
    }

    pub fn into_continued(self) -> Option<T> {
        match self {
            Dispatch::Continued(value) => Some(value),
            Dispatch::Paused => None,
        }
    }
}

/// Normalise a worker class name for use in keys: `Search::IndexWorker`
/// becomes `search/index_worker`.
pub fn underscore(worker: &str) -> String {
    let mut out = String::with_capacity(worker.len() + 4);
    let chars: Vec<char> = worker.replace("::", "/").chars().collect();
    for (i, ch) in chars.iter().enumerate() {
        if ch.is_ascii_uppercase() {
            let prev = i.checked_sub(1).map(|p| chars[p]);
            let next = chars.get(i + 1);
            let boundary = match prev {
                Some(p) if p.is_ascii_lowercase() || p.is_ascii_digit() => true,
                Some(p) if p.is_ascii_uppercase() => next.is_some_and(|n| n.is_ascii_lowercase()),
                _ => false,
            };
            if boundary {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(if *ch == '-' { '_' } else { *ch });
        }
    }
    out
}

/// Keep only the context keys named in `allow_list`.
pub fn filter_context(context: &JobContext, allow_list: &[String]) -> JobContext {
    context
        .iter()
        .filter(|(key, _)| allow_list.iter().any(|allowed| allowed == *key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn underscore_matches_class_path_conventions() {
        assert_eq!(underscore("Search::IndexWorker"), "search/index_worker");
        assert_eq!(underscore("HTTPClientWorker"), "http_client_worker");
        assert_eq!(underscore("Ci::BuildV2Worker"), "ci/build_v2_worker");
        assert_eq!(underscore("already_snake"), "already_snake");
    }

    #[test]
    fn filter_context_drops_unlisted_keys() {
        let context = JobPayload::new("W", vec![])
            .with_context("project_id", "7")
            .with_context("user", "root")
            .context;
        let filtered = filter_context(&context, &["project_id".to_string()]);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.get("project_id").map(String::as_str), Some("7"));
    }

    #[test]
    fn fresh_jobs_get_distinct_ids() {
        let a = JobPayload::new("W", vec![Value::from(1)]);
        let b = JobPayload::new("W", vec![Value::from(1)]);
        assert_ne!(a.jid, b.jid);
        assert_eq!(a.args, b.args);
    }

    #[test]
    fn dispatch_exposes_continued_value() {
        assert_eq!(Dispatch::Continued(3).into_continued(), Some(3));
        assert!(Dispatch::<u8>::Paused.is_paused());
    }
}
