use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ProviderError;

pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_TEMPERATURE: f64 = 1e-6;
pub const DEFAULT_INSTRUCTIONS: &str =
    "You are a document analyst. Answer questions using only the attached documents. \
     If the documents do not contain the answer, say so.";

/// Payload for creating an assistant/collection on the platform.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateAssistantRequest {
    pub instructions: String,
    pub model: String,
    pub temperature: f64,
}

impl CreateAssistantRequest {
    /// Build a request from optional caller instructions, falling back to defaults.
    pub fn with_instructions(instructions: Option<&str>) -> Self {
        Self {
            instructions: instructions.unwrap_or(DEFAULT_INSTRUCTIONS).to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
        }
    }
}

/// Remote run status as reported by the platform.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl RunPhase {
    /// Anything but queued/processing is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::str::FromStr for RunPhase {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" | "pending" => Ok(Self::Queued),
            "processing" | "in_progress" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown run phase: {other}")),
        }
    }
}

/// One observation of a run: its phase plus the remote error detail, if any.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunState {
    pub phase: RunPhase,
    pub error: Option<String>,
}

/// The full provider boundary: documents, assistants, threads, messages, runs.
/// All resources are keyed by provider-opaque string ids.
#[async_trait]
pub trait AssistantProvider: Send + Sync {
    async fn upload_document(&self, path: &Path) -> Result<String, ProviderError>;
    async fn document_info(&self, id: &str) -> Result<String, ProviderError>;
    async fn delete_document(&self, id: &str) -> Result<(), ProviderError>;

    async fn create_assistant(&self, req: &CreateAssistantRequest) -> Result<String, ProviderError>;
    async fn assistant_info(&self, id: &str) -> Result<String, ProviderError>;
    async fn delete_assistant(&self, id: &str) -> Result<(), ProviderError>;

    async fn create_thread(&self) -> Result<String, ProviderError>;
    async fn thread_info(&self, id: &str) -> Result<String, ProviderError>;
    async fn delete_thread(&self, id: &str) -> Result<(), ProviderError>;

    async fn create_message(
        &self,
        thread_id: &str,
        content: &str,
        attachments: &[String],
    ) -> Result<String, ProviderError>;

    async fn start_run(&self, thread_id: &str, assistant_id: &str) -> Result<String, ProviderError>;
    async fn run_status(&self, run_id: &str) -> Result<RunState, ProviderError>;

    /// Text content of the assistant messages produced by a completed run,
    /// in provider order.
    async fn list_messages(&self, thread_id: &str, run_id: &str)
        -> Result<Vec<String>, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_phase_terminal() {
        assert!(RunPhase::Completed.is_terminal());
        assert!(RunPhase::Failed.is_terminal());
        assert!(!RunPhase::Queued.is_terminal());
        assert!(!RunPhase::Processing.is_terminal());
    }

    #[test]
    fn run_phase_parses_provider_aliases() {
        assert_eq!("pending".parse::<RunPhase>().unwrap(), RunPhase::Queued);
        assert_eq!("in_progress".parse::<RunPhase>().unwrap(), RunPhase::Processing);
        assert!("cancelled".parse::<RunPhase>().is_err());
    }

    #[test]
    fn assistant_request_defaults() {
        let req = CreateAssistantRequest::with_instructions(None);
        assert_eq!(req.model, "gpt-4o");
        assert!(req.temperature < 1e-5);
        assert_eq!(req.instructions, DEFAULT_INSTRUCTIONS);

        let custom = CreateAssistantRequest::with_instructions(Some("Summarize only."));
        assert_eq!(custom.instructions, "Summarize only.");
    }
}
