use holdfast_counters::CounterError;
use holdfast_kernel::StoreError;
use holdfast_pause_control::PauseControlError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    PauseControl(#[from] PauseControlError),
    #[error(transparent)]
    Counter(#[from] CounterError),
}
