use lectern_core::errors::ProviderError;
use lectern_provider::PollError;
use lectern_store::StoreError;

/// Error taxonomy for session orchestration.
///
/// `is_retryable` is what the task executor consults: only transient
/// provider faults qualify. Validation, missing resources, remote-reported
/// run failures, poll timeouts, and exhausted run retries are all terminal —
/// the inner run-retry loop has already absorbed what it could, so the
/// outer task retry must not multiply it.
#[derive(Debug, thiserror::Error)]
pub enum AssistantError {
    #[error("{0}")]
    Validation(String),

    #[error("Invalid session")]
    InvalidSession,

    #[error("stale remote resource: {0}")]
    ResourceNotFound(String),

    #[error("run retries exceeded after {attempts} attempts")]
    RunRetriesExceeded { attempts: u32 },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Poll(#[from] PollError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AssistantError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable(),
            Self::Poll(PollError::Provider(e)) => e.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn transient_provider_faults_are_retryable() {
        let err = AssistantError::Provider(ProviderError::RateLimited { retry_after: None });
        assert!(err.is_retryable());

        let err = AssistantError::Poll(PollError::Provider(ProviderError::NetworkError(
            "reset".into(),
        )));
        assert!(err.is_retryable());
    }

    #[test]
    fn terminal_kinds_are_not_retryable() {
        assert!(!AssistantError::Validation("empty".into()).is_retryable());
        assert!(!AssistantError::InvalidSession.is_retryable());
        assert!(!AssistantError::ResourceNotFound("doc_1".into()).is_retryable());
        assert!(!AssistantError::RunRetriesExceeded { attempts: 2 }.is_retryable());
        assert!(!AssistantError::Poll(PollError::Timeout(Duration::from_secs(120))).is_retryable());
        assert!(!AssistantError::Poll(PollError::RemoteFailed("boom".into())).is_retryable());
        assert!(!AssistantError::Provider(ProviderError::NotFound("asst".into())).is_retryable());
    }

    #[test]
    fn invalid_session_message() {
        assert_eq!(AssistantError::InvalidSession.to_string(), "Invalid session");
    }
}
