use holdfast_kernel::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PauseControlError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Unknown pause strategy: {0}")]
    UnknownStrategy(String),
    #[error("Worker {worker} is already bound to strategy {existing}, cannot bind {requested}")]
    ConflictingStrategy {
        worker: String,
        existing: String,
        requested: String,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Submit failed for {worker}: {reason}")]
    Submit { worker: String, reason: String },
}
