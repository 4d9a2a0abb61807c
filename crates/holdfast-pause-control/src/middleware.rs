//! The two dispatch hooks and the dispatcher that wires them to a live queue.

use std::sync::Arc;

use crate::error::PauseControlError;
use crate::handler::StrategyHandler;
use crate::job::{Dispatch, JobPayload};
use crate::live_queue::LiveQueue;
use crate::queue::JobSubmitter;

/// Runs before a job is enqueued.
#[derive(Clone)]
pub struct ClientMiddleware {
    handler: StrategyHandler,
}

impl ClientMiddleware {
    pub fn new(handler: StrategyHandler) -> Self {
        Self { handler }
    }

    pub fn call<T, E, F>(&self, job: &JobPayload, next: F) -> Result<Dispatch<T>, E>
    where
        E: From<PauseControlError>,
        F: FnOnce() -> Result<T, E>,
    {
        self.handler.schedule(job, next)
    }
}

/// Runs before a dequeued job executes.
#[derive(Clone)]
pub struct ServerMiddleware {
    handler: StrategyHandler,
}

impl ServerMiddleware {
    pub fn new(handler: StrategyHandler) -> Self {
        Self { handler }
    }

    pub fn call<T, E, F>(&self, job: &JobPayload, next: F) -> Result<Dispatch<T>, E>
    where
        E: From<PauseControlError>,
        F: FnOnce() -> Result<T, E>,
    {
        self.handler.perform(job, next)
    }
}

/// Enqueue and execute paths with both hooks installed.
#[derive(Clone)]
pub struct Dispatcher {
    client: ClientMiddleware,
    server: ServerMiddleware,
    live: Arc<dyn LiveQueue>,
}

impl Dispatcher {
    pub fn new(handler: StrategyHandler, live: Arc<dyn LiveQueue>) -> Self {
        Self {
            client: ClientMiddleware::new(handler.clone()),
            server: ServerMiddleware::new(handler),
            live,
        }
    }

    pub fn live(&self) -> &Arc<dyn LiveQueue> {
        &self.live
    }

    pub fn enqueue(&self, job: &JobPayload) -> Result<Dispatch<()>, PauseControlError> {
        self.client.call(job, || self.live.push(job))
    }

    /// Run `work` for `job` unless its worker is paused, in which case the job
    /// goes back to the waiting queue.
    pub fn perform<T, E, F>(&self, job: &JobPayload, work: F) -> Result<Dispatch<T>, E>
    where
        E: From<PauseControlError>,
        F: FnOnce(&JobPayload) -> Result<T, E>,
    {
        self.server.call(job, || work(job))
    }

    /// Pop up to `limit` live jobs for `worker` and perform each. Returns how
    /// many ran; parked jobs are not counted.
    pub fn drain<E, F>(&self, worker: &str, limit: usize, mut work: F) -> Result<usize, E>
    where
        E: From<PauseControlError>,
        F: FnMut(&JobPayload) -> Result<(), E>,
    {
        let mut ran = 0;
        for job in self.live.pop(worker, limit)? {
            if let Dispatch::Continued(()) = self.perform(&job, &mut work)? {
                ran += 1;
            }
        }
        Ok(ran)
    }
}

/// Resumed jobs re-enter through the client hook, so a pause that flips back
/// on mid-resume parks them again instead of releasing them.
impl JobSubmitter for Dispatcher {
    fn submit(&self, job: &JobPayload) -> Result<(), PauseControlError> {
        self.enqueue(job).map(|_| ())
    }
}
