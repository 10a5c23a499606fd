use std::future::Future;
use std::time::Duration;

use tracing::debug;

use lectern_core::errors::ProviderError;
use lectern_core::provider::{RunPhase, RunState};

/// Fixed-interval polling parameters for eventually-consistent job status.
#[derive(Clone, Debug)]
pub struct PollConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Outcome taxonomy for a polled job. A timeout is a hard failure distinct
/// from an explicit remote-reported failure; the remote detail, when the
/// provider supplies one, is carried verbatim.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("polling timed out after {0:?}")]
    Timeout(Duration),

    #[error("remote run failed: {0}")]
    RemoteFailed(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Polls a status check to a terminal state.
#[derive(Clone, Debug, Default)]
pub struct PollingClient {
    config: PollConfig,
}

impl PollingClient {
    pub fn new(config: PollConfig) -> Self {
        Self { config }
    }

    /// Query status at a fixed interval until the run reaches a terminal
    /// phase or the timeout elapses.
    ///
    /// Completed runs return their final state. Failed runs surface as
    /// `RemoteFailed` with the provider's error detail verbatim.
    pub async fn until_terminal<F, Fut>(&self, mut check: F) -> Result<RunState, PollError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<RunState, ProviderError>>,
    {
        let started = tokio::time::Instant::now();

        loop {
            tokio::time::sleep(self.config.interval).await;

            let state = check().await?;
            debug!(phase = ?state.phase, "poll tick");

            if state.phase.is_terminal() {
                if state.phase == RunPhase::Failed {
                    let detail = state
                        .error
                        .unwrap_or_else(|| "no failure detail reported".to_string());
                    return Err(PollError::RemoteFailed(detail));
                }
                return Ok(state);
            }

            if started.elapsed() >= self.config.timeout {
                return Err(PollError::Timeout(self.config.timeout));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_config() -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(100),
            timeout: Duration::from_secs(2),
        }
    }

    fn state(phase: RunPhase, error: Option<&str>) -> RunState {
        RunState {
            phase,
            error: error.map(str::to_string),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn completes_after_pending_ticks() {
        let poller = PollingClient::new(fast_config());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = Arc::clone(&calls);

        let result = poller
            .until_terminal(move || {
                let calls = Arc::clone(&calls_in);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 3 {
                        Ok(state(RunPhase::Processing, None))
                    } else {
                        Ok(state(RunPhase::Completed, None))
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result.phase, RunPhase::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_failure_carries_detail_verbatim() {
        let poller = PollingClient::new(fast_config());

        let result = poller
            .until_terminal(|| async {
                Ok(state(RunPhase::Failed, Some("rate_limit_exceeded: slow down")))
            })
            .await;

        match result {
            Err(PollError::RemoteFailed(detail)) => {
                assert_eq!(detail, "rate_limit_exceeded: slow down");
            }
            other => panic!("expected RemoteFailed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn remote_failure_without_detail() {
        let poller = PollingClient::new(fast_config());

        let result = poller
            .until_terminal(|| async { Ok(state(RunPhase::Failed, None)) })
            .await;

        match result {
            Err(PollError::RemoteFailed(detail)) => {
                assert_eq!(detail, "no failure detail reported");
            }
            other => panic!("expected RemoteFailed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_distinct_failure() {
        let poller = PollingClient::new(fast_config());

        let result = poller
            .until_terminal(|| async { Ok(state(RunPhase::Queued, None)) })
            .await;

        match result {
            Err(PollError::Timeout(d)) => assert_eq!(d, Duration::from_secs(2)),
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn provider_error_propagates() {
        let poller = PollingClient::new(fast_config());

        let result = poller
            .until_terminal(|| async {
                Err::<RunState, _>(ProviderError::NetworkError("connection reset".into()))
            })
            .await;

        assert!(matches!(result, Err(PollError::Provider(ProviderError::NetworkError(_)))));
    }
}
