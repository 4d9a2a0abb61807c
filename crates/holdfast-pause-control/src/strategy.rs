//! The closed set of pause strategies.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PauseControlError;
use crate::job::{underscore, Dispatch, JobPayload};
use crate::queue::PauseControlQueue;
use crate::toggle::PauseToggle;

pub const SEARCH_INDEXING_TOGGLE: &str = "search_indexing";

pub(crate) const LOG_TARGET: &str = "holdfast::pause_control";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseStrategy {
    /// Never pauses.
    None,
    /// Paused while the toggle named after the worker class is on.
    WorkerToggle,
    /// Paused while the shared `search_indexing` toggle is on.
    SearchIndexing,
}

#[derive(Clone, Copy, Debug)]
enum Stage {
    Schedule,
    Perform,
}

impl Stage {
    fn as_str(self) -> &'static str {
        match self {
            Stage::Schedule => "schedule",
            Stage::Perform => "perform",
        }
    }
}

impl PauseStrategy {
    pub const ALL: [PauseStrategy; 3] = [
        PauseStrategy::None,
        PauseStrategy::WorkerToggle,
        PauseStrategy::SearchIndexing,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PauseStrategy::None => "none",
            PauseStrategy::WorkerToggle => "worker_toggle",
            PauseStrategy::SearchIndexing => "search_indexing",
        }
    }

    /// Name of the toggle this strategy consults for `worker`, if any.
    pub fn toggle_name(self, worker: &str) -> Option<String> {
        match self {
            PauseStrategy::None => None,
            PauseStrategy::WorkerToggle => Some(underscore(worker)),
            PauseStrategy::SearchIndexing => Some(SEARCH_INDEXING_TOGGLE.to_string()),
        }
    }

    /// Read the toggle fresh; a failed read is an error, never "not paused".
    pub fn should_pause(
        self,
        worker: &str,
        toggle: &dyn PauseToggle,
    ) -> Result<bool, PauseControlError> {
        match self.toggle_name(worker) {
            Some(name) => toggle.is_enabled(&name),
            None => Ok(false),
        }
    }

    /// Pre-enqueue hook: divert to the waiting queue while paused.
    pub fn schedule<T, E, F>(
        self,
        job: &JobPayload,
        queue: &PauseControlQueue,
        toggle: &dyn PauseToggle,
        continuation: F,
    ) -> Result<Dispatch<T>, E>
    where
        E: From<PauseControlError>,
        F: FnOnce() -> Result<T, E>,
    {
        self.intercept(Stage::Schedule, job, queue, toggle, continuation)
    }

    /// Pre-execute hook: same check, for jobs that were already enqueued
    /// before the pause took effect.
    pub fn perform<T, E, F>(
        self,
        job: &JobPayload,
        queue: &PauseControlQueue,
        toggle: &dyn PauseToggle,
        continuation: F,
    ) -> Result<Dispatch<T>, E>
    where
        E: From<PauseControlError>,
        F: FnOnce() -> Result<T, E>,
    {
        self.intercept(Stage::Perform, job, queue, toggle, continuation)
    }

    fn intercept<T, E, F>(
        self,
        stage: Stage,
        job: &JobPayload,
        queue: &PauseControlQueue,
        toggle: &dyn PauseToggle,
        continuation: F,
    ) -> Result<Dispatch<T>, E>
    where
        E: From<PauseControlError>,
        F: FnOnce() -> Result<T, E>,
    {
        if !self.should_pause(&job.worker, toggle)? {
            return continuation().map(Dispatch::Continued);
        }
        let score = queue.add_to_waiting_queue(job)?;
        tracing::info!(
            target: LOG_TARGET,
            event = "paused",
            worker = %job.worker,
            jid = %job.jid,
            strategy = self.as_str(),
            stage = stage.as_str(),
            score,
            "job diverted to waiting queue"
        );
        Ok(Dispatch::Paused)
    }
}

impl fmt::Display for PauseStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PauseStrategy {
    type Err = PauseControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PauseStrategy::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s.trim())
            .ok_or_else(|| PauseControlError::UnknownStrategy(s.to_string()))
    }
}
