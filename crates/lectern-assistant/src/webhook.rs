use std::time::Duration;

use serde::Serialize;
use tracing::{info, instrument, warn};

use lectern_core::webhook::WebhookConfig;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(20);

/// Outcome of one delivery attempt. Always returned, never raised —
/// webhook failure must not fail the task that computed the result.
#[derive(Clone, Debug, Serialize)]
pub struct DeliveryReport {
    pub delivered: bool,
    pub status: Option<u16>,
    pub error: Option<String>,
}

/// Best-effort single-shot POST of a result payload to a caller-supplied
/// endpoint.
pub struct WebhookDispatcher {
    client: reqwest::Client,
}

impl Default for WebhookDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookDispatcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(WEBHOOK_TIMEOUT)
                .build()
                .expect("failed to build HTTP client"),
        }
    }

    #[instrument(skip(self, config, payload), fields(endpoint = %config.endpoint))]
    pub async fn deliver(
        &self,
        config: &WebhookConfig,
        payload: &serde_json::Value,
    ) -> DeliveryReport {
        let mut req = self.client.post(&config.endpoint).json(payload);
        for (name, value) in &config.headers {
            req = req.header(name, value);
        }

        match req.send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if resp.status().is_success() {
                    info!(status, "webhook delivered");
                    DeliveryReport {
                        delivered: true,
                        status: Some(status),
                        error: None,
                    }
                } else {
                    let body = resp.text().await.unwrap_or_default();
                    warn!(status, body, "webhook rejected");
                    DeliveryReport {
                        delivered: false,
                        status: Some(status),
                        error: Some(format!("endpoint returned {status}: {body}")),
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "webhook unreachable");
                DeliveryReport {
                    delivered: false,
                    status: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}
