use holdfast_kernel::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CounterError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Repository error: {0}")]
    Repository(String),
    #[error("{record_type}.{attribute} is not a registered counter attribute")]
    UnknownAttribute {
        record_type: String,
        attribute: String,
    },
    #[error("{record_type}.{attribute} is not a buffered counter")]
    NotBuffered {
        record_type: String,
        attribute: String,
    },
    #[error("counter lease '{key}' is still held")]
    LeaseHeld { key: String },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
