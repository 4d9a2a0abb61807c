//! Store-level error type.

/// Errors surfaced by [crate::KeyValueStore] implementations and the primitives built on them.
///
/// Connectivity and backend failures are never retried inside the kernel; they
/// propagate to the caller, whose job queue owns the retry policy.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("value at key '{0}' is not an integer")]
    NotAnInteger(String),
    #[error("operation against key '{0}' holding the wrong kind of value")]
    WrongType(String),
    #[error("keys in script '{script}' hash to different slots")]
    CrossSlot { script: &'static str },
    #[error("store lock poisoned")]
    Poisoned,
    #[error("invalid store configuration: {0}")]
    Config(String),
}
