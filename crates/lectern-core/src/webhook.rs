use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Caller-supplied callback target for final results.
/// Travels inside the task payload; never persisted beyond it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub endpoint: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_default_to_empty() {
        let config: WebhookConfig =
            serde_json::from_str(r#"{"endpoint": "http://example.com/hook"}"#).unwrap();
        assert_eq!(config.endpoint, "http://example.com/hook");
        assert!(config.headers.is_empty());
    }

    #[test]
    fn serde_roundtrip() {
        let mut headers = HashMap::new();
        headers.insert("authorization".to_string(), "Bearer tok".to_string());
        let config = WebhookConfig {
            endpoint: "http://example.com/hook".to_string(),
            headers,
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: WebhookConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
