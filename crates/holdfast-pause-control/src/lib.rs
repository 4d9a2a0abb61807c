//! Pause/resume admission control for background job queues.
//!
//! While a worker class is paused, its jobs are diverted at enqueue or execute
//! time into a per-worker waiting queue in the shared store. A resume driver
//! later moves them, oldest first, back onto the live path.

pub mod error;
pub mod handler;
pub mod job;
pub mod live_queue;
pub mod middleware;
pub mod queue;
pub mod resume;
pub mod strategy;
pub mod toggle;
pub mod workers_map;

pub use error::PauseControlError;
pub use handler::StrategyHandler;
pub use job::{filter_context, underscore, Dispatch, JobArgs, JobContext, JobPayload};
pub use live_queue::{InMemoryLiveQueue, KvLiveQueue, LiveQueue};
pub use middleware::{ClientMiddleware, Dispatcher, ServerMiddleware};
pub use queue::{JobSubmitter, PauseControlQueue, DEFAULT_CONTEXT_ALLOW_LIST, LIMIT};
pub use resume::{ResumeDriver, ResumeReport, RESCHEDULE_DELAY};
pub use strategy::{PauseStrategy, SEARCH_INDEXING_TOGGLE};
pub use toggle::{KvPauseToggle, PauseToggle, StaticPauseToggle};
pub use workers_map::WorkersMap;
