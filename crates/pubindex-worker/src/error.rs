//! Error taxonomy of the worker
//!
//! Each kind has one handling policy:
//!
//! - [`ValidationError`]: the message is discarded (it was already acknowledged)
//! - [`StageError`]: terminal for the message, logged with the stage name
//! - [`NotifyError`]: logged at warn, the outcome stays `Ok`
//! - [`TransportError`]: the consumer applies its reconnect policy

use std::time::Duration;
use thiserror::Error;

use crate::stages::Stage;

/// Malformed or incomplete message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid message: {0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// A named pipeline stage failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{stage} stage failed: {cause}")]
pub struct StageError {
    pub stage: Stage,
    pub cause: String,
}

impl StageError {
    pub fn new(stage: Stage, cause: impl Into<String>) -> Self {
        Self {
            stage,
            cause: cause.into(),
        }
    }

    /// Flatten an error chain into the stored cause
    pub fn from_anyhow(stage: Stage, err: &anyhow::Error) -> Self {
        Self::new(stage, format!("{:#}", err))
    }

    pub fn timed_out(stage: Stage, limit: Duration) -> Self {
        Self::new(stage, format!("timed out after {}s", limit.as_secs()))
    }
}

impl From<ValidationError> for StageError {
    fn from(err: ValidationError) -> Self {
        Self::new(Stage::Validation, err.0)
    }
}

/// Best-effort portal callback failed
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("message carries no portal credential")]
    MissingCredential,

    #[error("portal responded with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("portal request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("portal request timed out after {0}s")]
    Timeout(u64),
}

/// Broker-level failure, independent of any message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to connect to broker: {0}")]
    Connect(String),

    #[error("failed to set up channel: {0}")]
    Channel(String),

    #[error("broker connection lost: {0}")]
    ConnectionLost(String),

    #[error("failed to acknowledge delivery {tag}: {cause}")]
    Ack { tag: u64, cause: String },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_stage_error_flattens_context_chain() {
        let err = std::fs::read("/definitely/not/here")
            .context("Failed to read staged file")
            .unwrap_err();
        let stage_err = StageError::from_anyhow(Stage::Extract, &err);

        assert_eq!(stage_err.stage, Stage::Extract);
        assert!(stage_err.cause.starts_with("Failed to read staged file: "));
        assert!(stage_err.to_string().starts_with("extract stage failed"));
    }

    #[test]
    fn test_validation_converts_to_stage_error() {
        let err: StageError = ValidationError::new("source path must not be empty").into();
        assert_eq!(err.stage, Stage::Validation);
        assert_eq!(err.cause, "source path must not be empty");
    }
}
