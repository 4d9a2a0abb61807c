//! Builds the stores and services described by a [HoldfastConfig].

use std::str::FromStr;
use std::sync::Arc;

use holdfast_counters::{
    CounterBackend, CounterRepository, FlushRunReport, FlushStaleCounterIncrements, FlushWorker,
    InMemoryCounterRepository, KvFlushScheduler,
};
use holdfast_kernel::{InMemoryKeyValueStore, SharedStore};
use holdfast_pause_control::{
    Dispatcher, KvLiveQueue, KvPauseToggle, LiveQueue, PauseControlError, PauseControlQueue,
    PauseStrategy, ResumeDriver, ResumeReport, StrategyHandler, WorkersMap,
};
use serde::Serialize;

use crate::config::{HoldfastConfig, StoreBackend};
use crate::error::RuntimeError;

/// A `strategy=Worker` pair given on the command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerBinding {
    pub strategy: String,
    pub worker: String,
}

impl FromStr for WorkerBinding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (strategy, worker) = s
            .split_once('=')
            .map(|(strategy, worker)| (strategy.trim(), worker.trim()))
            .filter(|(strategy, worker)| !strategy.is_empty() && !worker.is_empty())
            .ok_or_else(|| format!("expected strategy=Worker, got '{s}'"))?;
        Ok(Self {
            strategy: strategy.to_string(),
            worker: worker.to_string(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub worker: String,
    pub strategy: PauseStrategy,
    pub paused: bool,
    pub waiting: u64,
    pub live: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub resume: ResumeReport,
    pub flush: FlushRunReport,
    /// Expired keys (leases, flush markers) removed from the store.
    pub purged: u64,
}

/// Jobs drained from the flush schedule per tick.
pub const FLUSH_BATCH: usize = 1000;

pub struct Holdfast {
    pub store: SharedStore,
    pub workers: Arc<WorkersMap>,
    pub queue: Arc<PauseControlQueue>,
    pub toggle: Arc<KvPauseToggle>,
    pub live: Arc<KvLiveQueue>,
    pub dispatcher: Arc<Dispatcher>,
    pub resume: ResumeDriver,
    pub counters: Arc<CounterBackend>,
    pub flush_worker: FlushWorker,
    pub flush_stale: FlushStaleCounterIncrements,
}

impl Holdfast {
    /// Wire everything up. Bad bindings abort here, before any job moves.
    pub fn build(config: &HoldfastConfig, bindings: &[WorkerBinding]) -> Result<Self, RuntimeError> {
        let mut workers = WorkersMap::new();
        for binding in bindings {
            workers.set_strategy_for(&binding.strategy, &binding.worker)?;
        }
        let workers = Arc::new(workers);

        let store = open_store(config)?;
        let queue = Arc::new(
            PauseControlQueue::new(store.clone())
                .with_context_allow_list(config.context_allow_list.clone()),
        );
        let toggle = Arc::new(KvPauseToggle::new(store.clone()));
        let live = Arc::new(KvLiveQueue::new(store.clone()));
        let handler = StrategyHandler::new(workers.clone(), queue.clone(), toggle.clone());
        let dispatcher = Arc::new(Dispatcher::new(handler, live.clone()));
        let resume = ResumeDriver::new(workers.clone(), queue.clone(), toggle.clone(), dispatcher.clone())
            .with_iterations(config.resume_iterations);

        let counters = Arc::new(
            CounterBackend::new(
                store.clone(),
                open_counter_repository(config)?,
                Arc::new(KvFlushScheduler::new(store.clone())),
                config.buffered_attributes.clone(),
            )
            .with_config(config.counters),
        );

        Ok(Self {
            store,
            workers,
            queue,
            toggle,
            live,
            dispatcher,
            resume,
            flush_worker: FlushWorker::new(counters.clone()),
            flush_stale: FlushStaleCounterIncrements::new(counters.clone()),
            counters,
        })
    }

    pub fn status(&self) -> Result<Vec<WorkerStatus>, PauseControlError> {
        let mut statuses = Vec::with_capacity(self.workers.len());
        for (strategy, workers) in self.workers.workers() {
            for worker in workers {
                statuses.push(WorkerStatus {
                    paused: strategy.should_pause(&worker, self.toggle.as_ref())?,
                    waiting: self.queue.queue_size(&worker)?,
                    live: self.live.len(&worker)?,
                    strategy,
                    worker,
                });
            }
        }
        Ok(statuses)
    }

    /// One resume sweep, one pass over due counter flushes, then a sweep of
    /// expired keys.
    pub fn tick(&self) -> Result<TickReport, RuntimeError> {
        let resume = self.resume.tick()?;
        let flush = self.flush_worker.run_due(FLUSH_BATCH)?;
        let purged = self.store.purge_expired()?;
        if purged > 0 {
            tracing::debug!(purged, "expired keys removed");
        }
        Ok(TickReport {
            resume,
            flush,
            purged,
        })
    }
}

fn open_store(config: &HoldfastConfig) -> Result<SharedStore, RuntimeError> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(InMemoryKeyValueStore::new())),
        StoreBackend::Sqlite => open_sqlite_store(config),
    }
}

#[cfg(feature = "sqlite-persistence")]
fn open_sqlite_store(config: &HoldfastConfig) -> Result<SharedStore, RuntimeError> {
    Ok(Arc::new(holdfast_kernel::SqliteKeyValueStore::new(
        &config.sqlite_db_path,
    )?))
}

#[cfg(not(feature = "sqlite-persistence"))]
fn open_sqlite_store(_config: &HoldfastConfig) -> Result<SharedStore, RuntimeError> {
    Err(RuntimeError::Config(
        "HOLDFAST_STORE_BACKEND=sqlite requires feature 'sqlite-persistence'".to_string(),
    ))
}

fn open_counter_repository(
    config: &HoldfastConfig,
) -> Result<Arc<dyn CounterRepository>, RuntimeError> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(InMemoryCounterRepository::new())),
        #[cfg(feature = "sqlite-persistence")]
        StoreBackend::Sqlite => Ok(Arc::new(holdfast_counters::SqliteCounterRepository::new(
            &config.counters_db_path,
        )?)),
        #[cfg(not(feature = "sqlite-persistence"))]
        StoreBackend::Sqlite => Err(RuntimeError::Config(
            "HOLDFAST_STORE_BACKEND=sqlite requires feature 'sqlite-persistence'".to_string(),
        )),
    }
}
