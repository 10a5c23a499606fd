use async_trait::async_trait;

/// A task-body failure in serializable form: a readable message, the full
/// error chain, and whether the executor may schedule another attempt.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct TaskError {
    pub message: String,
    pub trace: String,
    pub retryable: bool,
}

impl TaskError {
    pub fn retryable(message: impl Into<String>, trace: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: trace.into(),
            retryable: true,
        }
    }

    pub fn terminal(message: impl Into<String>, trace: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: trace.into(),
            retryable: false,
        }
    }

    pub fn from_error(err: &(dyn std::error::Error + 'static), retryable: bool) -> Self {
        Self {
            message: err.to_string(),
            trace: error_chain(err),
            retryable,
        }
    }
}

/// Render an error and its source chain as a readable trace.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str("\ncaused by: ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

/// Maps task kinds to their bodies and per-kind attempt budgets.
/// The production router lives in lectern-assistant.
#[async_trait]
pub trait TaskRouter: Send + Sync {
    /// Maximum delivery attempts for a kind, including the first.
    fn max_attempts(&self, kind: &str) -> u32;

    async fn run(
        &self,
        kind: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, TaskError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer failed")]
    struct Outer {
        #[source]
        inner: Inner,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("inner cause")]
    struct Inner;

    #[test]
    fn error_chain_walks_sources() {
        let err = Outer { inner: Inner };
        let trace = error_chain(&err);
        assert_eq!(trace, "outer failed\ncaused by: inner cause");
    }

    #[test]
    fn from_error_captures_message_and_trace() {
        let err = Outer { inner: Inner };
        let task_err = TaskError::from_error(&err, true);
        assert_eq!(task_err.message, "outer failed");
        assert!(task_err.trace.contains("inner cause"));
        assert!(task_err.retryable);
    }

    #[test]
    fn constructors_set_retryability() {
        assert!(TaskError::retryable("m", "t").retryable);
        assert!(!TaskError::terminal("m", "t").retryable);
    }
}
