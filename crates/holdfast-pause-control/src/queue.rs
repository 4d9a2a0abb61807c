//! Per-worker waiting queue for paused jobs.
//!
//! Each worker class owns two keys that share a hash tag:
//! `pause_control:paused_jobs:zset:{worker}` holds the serialized jobs scored by
//! arrival, and `pause_control:paused_jobs:score:{worker}` is the counter that
//! hands out those scores. Resuming reads lowest-score-first, submits, and only
//! then removes the exact score range it read, so a crash between the two steps
//! replays a batch instead of losing it.

use holdfast_kernel::{ScoreRange, Script, SharedStore};
use serde::{Deserialize, Serialize};

use crate::error::PauseControlError;
use crate::job::{filter_context, underscore, JobArgs, JobContext, JobPayload};
use crate::strategy::LOG_TARGET;

pub const PAUSED_JOBS_PREFIX: &str = "pause_control:paused_jobs";
/// Jobs read per resume iteration.
pub const LIMIT: usize = 1000;
pub const DEFAULT_CONTEXT_ALLOW_LIST: &[&str] = &["project_id", "meta.project"];
pub const RELATED_CLASS_KEY: &str = "related_class";
pub const RELATED_CLASS: &str = "PauseControlQueue";

/// Hand-off point for resumed jobs: the live queue, or the dispatch path
/// that leads to it.
pub trait JobSubmitter: Send + Sync {
    fn submit(&self, job: &JobPayload) -> Result<(), PauseControlError>;
}

/// Stored form of a paused job. The worker is implied by the key.
#[derive(Debug, Serialize, Deserialize)]
struct PausedJobRecord {
    jid: String,
    args: JobArgs,
    #[serde(default)]
    context: JobContext,
}

pub struct PauseControlQueue {
    store: SharedStore,
    context_allow_list: Vec<String>,
    batch_limit: usize,
}

impl PauseControlQueue {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            context_allow_list: DEFAULT_CONTEXT_ALLOW_LIST
                .iter()
                .map(|key| key.to_string())
                .collect(),
            batch_limit: LIMIT,
        }
    }

    pub fn with_context_allow_list(mut self, allow_list: Vec<String>) -> Self {
        self.context_allow_list = allow_list;
        self
    }

    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit.max(1);
        self
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn waiting_set_key(worker: &str) -> String {
        format!("{PAUSED_JOBS_PREFIX}:zset:{{{}}}", underscore(worker))
    }

    pub fn score_key(worker: &str) -> String {
        format!("{PAUSED_JOBS_PREFIX}:score:{{{}}}", underscore(worker))
    }

    /// Park `job` behind every job already waiting for its worker. Returns the
    /// score it was given.
    pub fn add_to_waiting_queue(&self, job: &JobPayload) -> Result<i64, PauseControlError> {
        let record = PausedJobRecord {
            jid: job.jid.clone(),
            args: job.args.clone(),
            context: filter_context(&job.context, &self.context_allow_list),
        };
        let member = serde_json::to_string(&record)?;
        let score = self.store.eval(&Script::ScoredInsert {
            set_key: Self::waiting_set_key(&job.worker),
            score_key: Self::score_key(&job.worker),
            member,
        })?;
        Ok(score)
    }

    pub fn has_jobs_in_waiting_queue(&self, worker: &str) -> Result<bool, PauseControlError> {
        Ok(self.store.exists(&Self::waiting_set_key(worker))?)
    }

    pub fn queue_size(&self, worker: &str) -> Result<u64, PauseControlError> {
        Ok(self.store.zcard(&Self::waiting_set_key(worker))?)
    }

    /// Move up to `iterations` batches of waiting jobs to `submitter`, oldest
    /// first. Returns how many jobs are still waiting.
    ///
    /// A submit failure aborts before the batch is removed; the whole batch is
    /// replayed next time, so jobs are delivered at least once.
    pub fn resume_processing(
        &self,
        worker: &str,
        iterations: usize,
        submitter: &dyn JobSubmitter,
    ) -> Result<u64, PauseControlError> {
        let set_key = Self::waiting_set_key(worker);
        let score_key = Self::score_key(worker);

        for _ in 0..iterations {
            let batch = self
                .store
                .zrange_by_score(&set_key, ScoreRange::all(), self.batch_limit)?;
            let (Some((_, first)), Some((_, last))) = (batch.first(), batch.last()) else {
                break;
            };
            let observed = ScoreRange::between(*first, *last);

            for (member, score) in &batch {
                let record = match serde_json::from_str::<PausedJobRecord>(member) {
                    Ok(record) => record,
                    Err(err) => {
                        tracing::warn!(
                            target: LOG_TARGET,
                            worker,
                            score = *score,
                            error = %err,
                            "dropping undecodable paused job"
                        );
                        continue;
                    }
                };
                let job = record.into_job(worker);
                submitter.submit(&job)?;
                tracing::info!(
                    target: LOG_TARGET,
                    event = "resumed",
                    worker,
                    jid = %job.jid,
                    score = *score,
                    "paused job resubmitted"
                );
            }

            self.store.zrem_range_by_score(&set_key, observed)?;
        }

        let remaining = self.store.eval(&Script::DropWhenEmpty { set_key, score_key })?;
        Ok(u64::try_from(remaining).unwrap_or(0))
    }
}

impl PausedJobRecord {
    fn into_job(self, worker: &str) -> JobPayload {
        let mut context = self.context;
        context.insert(RELATED_CLASS_KEY.to_string(), RELATED_CLASS.to_string());
        JobPayload {
            jid: self.jid,
            worker: worker.to_string(),
            args: self.args,
            context,
        }
    }
}
