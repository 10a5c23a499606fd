use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart;
use reqwest::{Client, Response};
use tracing::instrument;

use lectern_core::errors::ProviderError;
use lectern_core::provider::{AssistantProvider, CreateAssistantRequest, RunState};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection parameters for the assistant platform.
#[derive(Clone, Debug)]
pub struct PlatformConfig {
    pub base_uri: String,
    pub api_key: String,
}

/// reqwest-backed client for the assistant platform.
///
/// All endpoints answer with a JSON envelope: `{"data": {...}}` on success,
/// `{"success": bool, "error": ...}` for removals.
pub struct PlatformClient {
    client: Client,
    config: PlatformConfig,
}

impl PlatformClient {
    pub fn new(config: PlatformConfig) -> Self {
        Self {
            client: Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .build()
                .expect("failed to build HTTP client"),
            config,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_uri.trim_end_matches('/'), path)
    }

    fn auth_header(&self) -> String {
        format!("ApiKey {}", self.config.api_key)
    }

    async fn get_envelope(&self, path: &str) -> Result<serde_json::Value, ProviderError> {
        let resp = self
            .client
            .get(self.url(path))
            .header("x-api-key", self.auth_header())
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;
        read_envelope(resp).await
    }

    async fn post_envelope(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError> {
        let resp = self
            .client
            .post(self.url(path))
            .header("x-api-key", self.auth_header())
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;
        read_envelope(resp).await
    }

    /// GET a removal endpoint and check its `success` flag.
    async fn remove(&self, path: &str, id: &str) -> Result<(), ProviderError> {
        let envelope = self.get_envelope(path).await?;
        if envelope["success"].as_bool().unwrap_or(false) {
            Ok(())
        } else {
            let detail = envelope["error"].as_str().unwrap_or("no detail");
            Err(ProviderError::InvalidRequest(format!(
                "remove rejected for {id}: {detail}"
            )))
        }
    }
}

/// Map an HTTP response to the envelope JSON or a classified error.
async fn read_envelope(resp: Response) -> Result<serde_json::Value, ProviderError> {
    let status = resp.status();
    if !status.is_success() {
        if status.as_u16() == 429 {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ProviderError::RateLimited { retry_after });
        }
        let body = resp.text().await.unwrap_or_default();
        return Err(ProviderError::from_status(status.as_u16(), body));
    }

    resp.json()
        .await
        .map_err(|e| ProviderError::NetworkError(format!("malformed response body: {e}")))
}

fn data_id(envelope: &serde_json::Value) -> Result<String, ProviderError> {
    envelope["data"]["id"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ProviderError::NetworkError("malformed response: missing data.id".into()))
}

#[async_trait]
impl AssistantProvider for PlatformClient {
    #[instrument(skip(self), fields(path = %path.display()))]
    async fn upload_document(&self, path: &Path) -> Result<String, ProviderError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ProviderError::InvalidRequest(format!("read {}: {e}", path.display())))?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("document")
            .to_string();

        let part = multipart::Part::bytes(bytes)
            .file_name(filename)
            .mime_str("application/octet-stream")
            .map_err(|e| ProviderError::InvalidRequest(e.to_string()))?;
        let form = multipart::Form::new().part("src", part);

        let resp = self
            .client
            .post(self.url("/documents/upload"))
            .header("x-api-key", self.auth_header())
            .multipart(form)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        data_id(&read_envelope(resp).await?)
    }

    async fn document_info(&self, id: &str) -> Result<String, ProviderError> {
        data_id(&self.get_envelope(&format!("/documents/info/{id}")).await?)
    }

    async fn delete_document(&self, id: &str) -> Result<(), ProviderError> {
        self.remove(&format!("/documents/remove/{id}"), id).await
    }

    #[instrument(skip(self, req))]
    async fn create_assistant(
        &self,
        req: &CreateAssistantRequest,
    ) -> Result<String, ProviderError> {
        let body = serde_json::json!({
            "instructions": req.instructions,
            "model": req.model,
            "temperature": req.temperature,
        });
        data_id(&self.post_envelope("/assistants/create", &body).await?)
    }

    async fn assistant_info(&self, id: &str) -> Result<String, ProviderError> {
        data_id(&self.get_envelope(&format!("/assistants/info/{id}")).await?)
    }

    async fn delete_assistant(&self, id: &str) -> Result<(), ProviderError> {
        self.remove(&format!("/assistants/remove/{id}"), id).await
    }

    async fn create_thread(&self) -> Result<String, ProviderError> {
        data_id(&self.post_envelope("/threads/create", &serde_json::json!({})).await?)
    }

    async fn thread_info(&self, id: &str) -> Result<String, ProviderError> {
        data_id(&self.get_envelope(&format!("/threads/info/{id}")).await?)
    }

    async fn delete_thread(&self, id: &str) -> Result<(), ProviderError> {
        self.remove(&format!("/threads/remove/{id}"), id).await
    }

    async fn create_message(
        &self,
        thread_id: &str,
        content: &str,
        attachments: &[String],
    ) -> Result<String, ProviderError> {
        let body = serde_json::json!({
            "thread_id": thread_id,
            "content": content,
            "attachments": attachments,
        });
        data_id(&self.post_envelope("/messages/create", &body).await?)
    }

    #[instrument(skip(self))]
    async fn start_run(&self, thread_id: &str, assistant_id: &str) -> Result<String, ProviderError> {
        let body = serde_json::json!({
            "thread_id": thread_id,
            "assistant_id": assistant_id,
        });
        data_id(&self.post_envelope("/runs/start", &body).await?)
    }

    async fn run_status(&self, run_id: &str) -> Result<RunState, ProviderError> {
        let envelope = self.get_envelope(&format!("/runs/status/{run_id}")).await?;
        let raw = envelope["data"]["status"].as_str().ok_or_else(|| {
            ProviderError::NetworkError("malformed response: missing data.status".into())
        })?;
        let phase = raw
            .parse()
            .map_err(|e: String| ProviderError::NetworkError(format!("malformed response: {e}")))?;
        let error = envelope["data"]["error"].as_str().map(str::to_string);
        Ok(RunState { phase, error })
    }

    async fn list_messages(
        &self,
        thread_id: &str,
        run_id: &str,
    ) -> Result<Vec<String>, ProviderError> {
        let envelope = self
            .get_envelope(&format!("/messages/list/{thread_id}?run_id={run_id}"))
            .await?;
        let messages = envelope["data"]["messages"].as_array().ok_or_else(|| {
            ProviderError::NetworkError("malformed response: missing data.messages".into())
        })?;
        Ok(messages
            .iter()
            .filter_map(|m| m["content"].as_str().map(str::to_string))
            .collect())
    }
}
