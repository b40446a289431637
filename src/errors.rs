use std::time::Duration;
use thiserror::Error;

/// Failure taxonomy for a backup run.
///
/// Per-entry errors never escape a task: the orchestrator folds them into the
/// failed/skipped counters. Only `Setup` and `Config` reach the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackupError {
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// `retry_after` carries the server's `Retry-After` hint when it sent one.
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Unsupported content kind: {0}")]
    UnsupportedContentKind(String),

    #[error("Source entry inaccessible: {0}")]
    PermanentSource(String),

    #[error("Destination write failed: {0}")]
    DestinationWrite(String),

    #[error("State store error: {0}")]
    StateStore(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Setup failed: {0}")]
    Setup(String),
}

impl BackupError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackupError::TransientNetwork(_)
                | BackupError::RateLimited { .. }
                | BackupError::DestinationWrite(_)
        )
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        BackupError::RateLimited {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Short label used in logs and in the failure histogram.
    pub fn kind(&self) -> &'static str {
        match self {
            BackupError::TransientNetwork(_) => "transient-network",
            BackupError::RateLimited { .. } => "rate-limited",
            BackupError::UnsupportedContentKind(_) => "unsupported-kind",
            BackupError::PermanentSource(_) => "permanent-source",
            BackupError::DestinationWrite(_) => "destination-write",
            BackupError::StateStore(_) => "state-store",
            BackupError::Config(_) => "config",
            BackupError::Setup(_) => "setup",
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(BackupError::TransientNetwork("reset".into()).is_retryable());
        assert!(BackupError::rate_limited("429").is_retryable());
        assert!(BackupError::DestinationWrite("503".into()).is_retryable());
        assert!(!BackupError::PermanentSource("404".into()).is_retryable());
        assert!(!BackupError::UnsupportedContentKind("form".into()).is_retryable());
        assert!(!BackupError::Setup("no token".into()).is_retryable());
    }
}
