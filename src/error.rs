//! Error types shared across the engine
//!
//! Per-item content failures are not errors: they are [`Outcome`](crate::services::escalation::Outcome)s
//! absorbed by the escalation policy. What remains here either stops startup
//! ([`ConfigError`]) or stops a run ([`RunError`]).

use thiserror::Error;

use crate::media::MediaServerError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Failure while scanning a window of items
#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Server(#[from] MediaServerError),
    #[error("state store error: {0}")]
    Store(#[from] sqlx::Error),
}

/// Failure that aborts a whole run
#[derive(Debug, Error)]
pub enum RunError {
    #[error("media server unavailable after {attempts} liveness checks")]
    ServerUnavailable { attempts: u32 },
    #[error("media server error: {0}")]
    Server(MediaServerError),
    #[error("state store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl From<ScanError> for RunError {
    fn from(err: ScanError) -> Self {
        match err {
            ScanError::Server(e) => RunError::Server(e),
            ScanError::Store(e) => RunError::Store(e),
        }
    }
}
