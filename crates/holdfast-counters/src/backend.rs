use std::sync::Arc;
use std::time::Duration;

use holdfast_kernel::SharedStore;

use crate::attributes::{CounterAttributes, CounterMode};
use crate::buffered::BufferedCounter;
use crate::callbacks::CounterCallbacks;
use crate::counter::Counter;
use crate::error::CounterError;
use crate::legacy::LegacyCounter;
use crate::record::{CounterRecord, FlushTarget};
use crate::repository::CounterRepository;
use crate::scheduler::FlushScheduler;

pub const FLUSH_DELAY: Duration = Duration::from_secs(10 * 60);
pub const LEASE_TTL: Duration = Duration::from_secs(10 * 60);
/// How long `reset` waits for an in-flight flush to release the counter lease.
pub const RESET_WAIT: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CounterConfig {
    pub flush_delay: Duration,
    pub lease_ttl: Duration,
    pub reset_wait: Duration,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            flush_delay: FLUSH_DELAY,
            lease_ttl: LEASE_TTL,
            reset_wait: RESET_WAIT,
        }
    }
}

/// Everything a counter needs, shared by all counters of a process.
pub struct CounterBackend {
    store: SharedStore,
    repository: Arc<dyn CounterRepository>,
    scheduler: Arc<dyn FlushScheduler>,
    attributes: CounterAttributes,
    callbacks: CounterCallbacks,
    config: CounterConfig,
}

impl CounterBackend {
    pub fn new(
        store: SharedStore,
        repository: Arc<dyn CounterRepository>,
        scheduler: Arc<dyn FlushScheduler>,
        attributes: CounterAttributes,
    ) -> Self {
        Self {
            store,
            repository,
            scheduler,
            attributes,
            callbacks: CounterCallbacks::default(),
            config: CounterConfig::default(),
        }
    }

    pub fn with_callbacks(mut self, callbacks: CounterCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn with_config(mut self, config: CounterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn repository(&self) -> &Arc<dyn CounterRepository> {
        &self.repository
    }

    pub fn scheduler(&self) -> &Arc<dyn FlushScheduler> {
        &self.scheduler
    }

    pub fn attributes(&self) -> &CounterAttributes {
        &self.attributes
    }

    pub fn callbacks(&self) -> &CounterCallbacks {
        &self.callbacks
    }

    pub fn config(&self) -> CounterConfig {
        self.config
    }

    /// The counter for `record.attribute`, backed the way the attribute was
    /// registered.
    pub fn counter_for(
        self: &Arc<Self>,
        record: &CounterRecord,
        attribute: &str,
    ) -> Result<Box<dyn Counter>, CounterError> {
        let target = FlushTarget::new(record.clone(), attribute);
        Ok(match self.attributes.mode_for(&record.record_type, attribute)? {
            CounterMode::Buffered => Box::new(BufferedCounter::new(self.clone(), target)),
            CounterMode::Legacy => Box::new(LegacyCounter::new(self.clone(), target)),
        })
    }

    /// Like [CounterBackend::counter_for] but only for buffered attributes,
    /// which is what flushing needs.
    pub fn buffered_counter(
        self: &Arc<Self>,
        record: &CounterRecord,
        attribute: &str,
    ) -> Result<BufferedCounter, CounterError> {
        match self.attributes.mode_for(&record.record_type, attribute)? {
            CounterMode::Buffered => Ok(BufferedCounter::new(
                self.clone(),
                FlushTarget::new(record.clone(), attribute),
            )),
            CounterMode::Legacy => Err(CounterError::NotBuffered {
                record_type: record.record_type.clone(),
                attribute: attribute.to_string(),
            }),
        }
    }

    pub fn durable_value(&self, target: &FlushTarget) -> Result<i64, CounterError> {
        self.repository.read(target)
    }
}
