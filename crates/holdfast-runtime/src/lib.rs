//! Process wiring for Holdfast: configuration, logging and the assembled
//! pause-control and counter services the `holdfast` binary drives.

pub mod app;
pub mod config;
pub mod error;
pub mod logging;

pub use app::{Holdfast, TickReport, WorkerBinding, WorkerStatus, FLUSH_BATCH};
pub use config::{HoldfastConfig, StoreBackend};
pub use error::RuntimeError;
pub use logging::init_logging;
