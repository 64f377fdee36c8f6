//! Outbox error types.

use std::time::Duration;
use thiserror::Error;

/// Outbox error type.
///
/// None of these reach the producer of an event: delivery failures send the
/// event to the store, persistence failures are logged and retried on the
/// next checkpoint.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Collector rejected or never acknowledged the send
    #[error("Transport failure: {0}")]
    Transport(String),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Transport call exceeded the caller-imposed timeout
    #[error("Send timed out after {0:?}")]
    Timeout(Duration),

    /// Cache or identity file exists but does not hold a valid snapshot
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Snapshot could not be encoded
    #[error("Encode error: {0}")]
    Encode(String),

    /// Reading or writing a durable file failed
    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] appfit_config_and_utils::CoreError),

    /// Background task could not be started or panicked
    #[error("Task error: {0}")]
    Task(String),
}

impl OutboxError {
    /// Whether a later attempt can succeed without intervention.
    ///
    /// Transport failures go to the retry path, an undecodable cache is
    /// replaced by the next checkpoint, and a failed write is retried on the
    /// next interval. Encoding, configuration and task errors are not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            OutboxError::Transport(_)
                | OutboxError::Http(_)
                | OutboxError::Timeout(_)
                | OutboxError::Decode(_)
                | OutboxError::Filesystem(_)
        )
    }
}

/// Result type alias using OutboxError.
pub type OutboxResult<T> = Result<T, OutboxError>;
