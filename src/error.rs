//! Error types for the bus.

use thiserror::Error;

/// Main error type for bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Writer scope requires an explicit key for this operation")]
    KeyRequired,

    #[error("Key is outside this writer's scope")]
    KeyOutOfScope,

    #[error("No updater registered for tag: {0}")]
    UpdaterNotRegistered(String),

    #[error("No current value to apply a partial update to")]
    NoCurrentValue,

    #[error("Unknown writer: {0}")]
    UnknownWriter(u64),

    #[error("Unknown reader: {0}")]
    UnknownReader(u64),

    #[error("Topic is closed")]
    Closed,
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;
