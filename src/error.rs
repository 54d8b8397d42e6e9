//! Failure taxonomy for the conversation pipeline

use std::time::Duration;

use crate::backend::BackendError;
use crate::db::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum BotError {
    #[error("user {0} has not accepted the usage terms")]
    ConsentRequired(String),

    #[error("no model given and guild {0} has no default model")]
    NoDefaultModel(String),

    #[error("attachment is {size} bytes, limit is {limit}")]
    AttachmentTooLarge { size: u64, limit: u64 },

    #[error("attachment processing failed: {0}")]
    AttachmentProcessingFailed(String),

    #[error("model backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("model backend error: {0}")]
    BackendError(String),

    #[error("model backend timed out after {0:?}")]
    BackendTimeout(Duration),

    #[error("failed to persist: {0}")]
    StorePersistFailed(#[from] StoreError),

    #[error("prompt is empty")]
    EmptyPrompt,

    #[error("command requires administrator permission")]
    PermissionDenied,
}

impl BotError {
    /// Map a backend failure, attributing client-side timeouts to `timeout`
    pub fn from_backend(err: BackendError, timeout: Duration) -> Self {
        match err {
            BackendError::Unavailable(msg) => Self::BackendUnavailable(msg),
            BackendError::Timeout => Self::BackendTimeout(timeout),
            BackendError::Response(msg) => Self::BackendError(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, BotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_backend() {
        let timeout = Duration::from_secs(3);
        assert!(matches!(
            BotError::from_backend(BackendError::Unavailable("refused".into()), timeout),
            BotError::BackendUnavailable(_)
        ));
        assert!(matches!(
            BotError::from_backend(BackendError::Timeout, timeout),
            BotError::BackendTimeout(d) if d == timeout
        ));
        assert!(matches!(
            BotError::from_backend(BackendError::Response("500".into()), timeout),
            BotError::BackendError(_)
        ));
    }
}
