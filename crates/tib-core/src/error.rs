//! Error taxonomy. Policy subsystems (GPS filter, history policy, watchdog,
//! retention plan) never raise — they return decisions. Only the
//! persistence port and the message router's payload parsing can fail, and
//! they fail with one of these explicit, matchable types.

use thiserror::Error;

/// Raised by [`crate::port::PersistencePort`] operations.
#[derive(Debug, Error)]
pub enum PersistError {
    /// Retryable I/O fault: network blip, pool exhaustion, timeout.
    #[error("transient persistence error: {0}")]
    Transient(String),

    /// Schema/constraint violation or other unrecoverable store error.
    #[error("fatal persistence error: {0}")]
    Fatal(String),
}

impl PersistError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, PersistError::Fatal(_))
    }
}

/// Malformed topic or JSON payload. Dropped silently (debug-logged only),
/// never raised as an event.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("topic did not match any known pattern: {0}")]
    UnrecognisedTopic(String),

    #[error("malformed JSON payload: {0}")]
    MalformedJson(String),
}

/// Logically impossible configuration or state, e.g. negative tolerance.
/// Fatal: the caller should abort startup.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid policy configuration: {0}")]
    InvalidConfig(String),
}
