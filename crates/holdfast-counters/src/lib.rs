//! Buffered counters: high-frequency increments are absorbed by the shared
//! key-value store and committed to a durable repository in coalesced writes.
//!
//! [BufferedCounter] and [LegacyCounter] both implement [Counter], so callers
//! pick neither; the [CounterAttributes] registry decides per attribute.

pub mod attributes;
pub mod backend;
pub mod buffered;
pub mod callbacks;
pub mod counter;
pub mod error;
pub mod flush_stale;
pub mod flush_worker;
pub mod legacy;
pub mod record;
pub mod repository;
pub mod scheduler;
#[cfg(feature = "sqlite-persistence")]
pub mod sqlite_repository;

pub use attributes::{CounterAttributes, CounterMode};
pub use backend::{CounterBackend, CounterConfig, FLUSH_DELAY, LEASE_TTL, RESET_WAIT};
pub use buffered::{BufferedCounter, FlushOutcome};
pub use callbacks::{CounterCallback, CounterCallbacks};
pub use counter::Counter;
pub use error::CounterError;
pub use flush_stale::{FlushStaleCounterIncrements, FlushStaleReport, BATCH_SIZE};
pub use flush_worker::{FlushRunReport, FlushWorker};
pub use legacy::LegacyCounter;
pub use record::{CounterRecord, FlushTarget};
pub use repository::{BeforeCommit, CounterRepository, InMemoryCounterRepository};
pub use scheduler::{FlushScheduler, KvFlushScheduler, ScheduledFlush, FLUSH_SCHEDULE_KEY};
#[cfg(feature = "sqlite-persistence")]
pub use sqlite_repository::SqliteCounterRepository;
