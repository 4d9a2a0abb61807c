//! Where admitted jobs wait for a worker to pick them up.

use std::sync::Mutex;

use holdfast_kernel::{ScoreRange, Script, SharedStore, StoreError};

use crate::error::PauseControlError;
use crate::job::{underscore, JobPayload};
use crate::queue::JobSubmitter;

pub const LIVE_JOBS_PREFIX: &str = "jobs:live";

pub trait LiveQueue: Send + Sync {
    fn push(&self, job: &JobPayload) -> Result<(), PauseControlError>;

    /// Claim up to `limit` of the oldest jobs for `worker`.
    fn pop(&self, worker: &str, limit: usize) -> Result<Vec<JobPayload>, PauseControlError>;

    fn len(&self, worker: &str) -> Result<u64, PauseControlError>;
}

impl<Q: LiveQueue + ?Sized> JobSubmitter for Q {
    fn submit(&self, job: &JobPayload) -> Result<(), PauseControlError> {
        self.push(job)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryLiveQueue {
    jobs: Mutex<Vec<JobPayload>>,
}

impl InMemoryLiveQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every job pushed so far, oldest first, across all workers.
    pub fn snapshot(&self) -> Result<Vec<JobPayload>, PauseControlError> {
        Ok(self.jobs.lock().map_err(|_| StoreError::Poisoned)?.clone())
    }
}

impl LiveQueue for InMemoryLiveQueue {
    fn push(&self, job: &JobPayload) -> Result<(), PauseControlError> {
        self.jobs
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .push(job.clone());
        Ok(())
    }

    fn pop(&self, worker: &str, limit: usize) -> Result<Vec<JobPayload>, PauseControlError> {
        let mut jobs = self.jobs.lock().map_err(|_| StoreError::Poisoned)?;
        let mut claimed = Vec::new();
        let mut kept = Vec::with_capacity(jobs.len());
        for job in jobs.drain(..) {
            if job.worker == worker && claimed.len() < limit {
                claimed.push(job);
            } else {
                kept.push(job);
            }
        }
        *jobs = kept;
        Ok(claimed)
    }

    fn len(&self, worker: &str) -> Result<u64, PauseControlError> {
        let jobs = self.jobs.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(jobs.iter().filter(|job| job.worker == worker).count() as u64)
    }
}

/// Live jobs in the shared store, one sorted set per worker scored by arrival.
#[derive(Clone)]
pub struct KvLiveQueue {
    store: SharedStore,
}

impl KvLiveQueue {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub fn set_key(worker: &str) -> String {
        format!("{LIVE_JOBS_PREFIX}:zset:{{{}}}", underscore(worker))
    }

    pub fn score_key(worker: &str) -> String {
        format!("{LIVE_JOBS_PREFIX}:score:{{{}}}", underscore(worker))
    }
}

impl LiveQueue for KvLiveQueue {
    fn push(&self, job: &JobPayload) -> Result<(), PauseControlError> {
        self.store.eval(&Script::ScoredInsert {
            set_key: Self::set_key(&job.worker),
            score_key: Self::score_key(&job.worker),
            member: serde_json::to_string(job)?,
        })?;
        Ok(())
    }

    fn pop(&self, worker: &str, limit: usize) -> Result<Vec<JobPayload>, PauseControlError> {
        let set_key = Self::set_key(worker);
        let mut claimed = Vec::new();
        for (member, _) in self.store.zrange_by_score(&set_key, ScoreRange::all(), limit)? {
            // Another consumer may have claimed it between the read and here.
            if !self.store.zrem(&set_key, &member)? {
                continue;
            }
            match serde_json::from_str::<JobPayload>(&member) {
                Ok(job) => claimed.push(job),
                Err(err) => tracing::warn!(worker, error = %err, "dropping undecodable live job"),
            }
        }
        Ok(claimed)
    }

    fn len(&self, worker: &str) -> Result<u64, PauseControlError> {
        Ok(self.store.zcard(&Self::set_key(worker))?)
    }
}
