use std::sync::Arc;

use crate::error::PauseControlError;
use crate::job::{Dispatch, JobPayload};
use crate::queue::PauseControlQueue;
use crate::toggle::PauseToggle;
use crate::workers_map::WorkersMap;

/// Resolves a job's strategy and delegates the hook to it. Workers without a
/// binding always proceed.
#[derive(Clone)]
pub struct StrategyHandler {
    workers: Arc<WorkersMap>,
    queue: Arc<PauseControlQueue>,
    toggle: Arc<dyn PauseToggle>,
}

impl StrategyHandler {
    pub fn new(
        workers: Arc<WorkersMap>,
        queue: Arc<PauseControlQueue>,
        toggle: Arc<dyn PauseToggle>,
    ) -> Self {
        Self {
            workers,
            queue,
            toggle,
        }
    }

    pub fn workers(&self) -> &Arc<WorkersMap> {
        &self.workers
    }

    pub fn queue(&self) -> &Arc<PauseControlQueue> {
        &self.queue
    }

    pub fn toggle(&self) -> &Arc<dyn PauseToggle> {
        &self.toggle
    }

    pub fn schedule<T, E, F>(&self, job: &JobPayload, continuation: F) -> Result<Dispatch<T>, E>
    where
        E: From<PauseControlError>,
        F: FnOnce() -> Result<T, E>,
    {
        match self.workers.strategy_for(&job.worker) {
            Some(strategy) => {
                strategy.schedule(job, &self.queue, self.toggle.as_ref(), continuation)
            }
            None => continuation().map(Dispatch::Continued),
        }
    }

    pub fn perform<T, E, F>(&self, job: &JobPayload, continuation: F) -> Result<Dispatch<T>, E>
    where
        E: From<PauseControlError>,
        F: FnOnce() -> Result<T, E>,
    {
        match self.workers.strategy_for(&job.worker) {
            Some(strategy) => {
                strategy.perform(job, &self.queue, self.toggle.as_ref(), continuation)
            }
            None => continuation().map(Dispatch::Continued),
        }
    }
}
