use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use lectern_core::ids::SessionId;
use lectern_core::webhook::WebhookConfig;
use lectern_queue::{error_chain, TaskError, TaskRouter};

use crate::error::AssistantError;
use crate::orchestrator::ResourceOrchestrator;
use crate::webhook::WebhookDispatcher;

pub const QUERY_TASK: &str = "query_session";
pub const CLOSE_TASK: &str = "close_session";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryTaskPayload {
    pub session_id: SessionId,
    pub prompts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloseTaskPayload {
    pub session_id: SessionId,
}

/// Production task router: dispatches queue rows to the orchestrator.
///
/// Budgets are per kind — queries get one retry on transient provider
/// faults, closes get three since cleanup must eventually land. Task bodies
/// are written for at-least-once delivery: a redelivered query resumes the
/// locked session's resources instead of creating new ones, and a
/// redelivered close re-deletes what is already gone.
pub struct AssistantRouter {
    orchestrator: ResourceOrchestrator,
    webhook: WebhookDispatcher,
}

impl AssistantRouter {
    pub fn new(orchestrator: ResourceOrchestrator) -> Self {
        Self {
            orchestrator,
            webhook: WebhookDispatcher::new(),
        }
    }

    #[instrument(skip(self, payload), fields(session_id = %payload.session_id))]
    async fn run_query(&self, payload: QueryTaskPayload) -> Result<serde_json::Value, TaskError> {
        if payload.prompts.is_empty() {
            return Err(task_error(AssistantError::Validation(
                "Input query is required".into(),
            )));
        }

        let resources = self
            .orchestrator
            .prepare(&payload.session_id, payload.instructions.as_deref())
            .await
            .map_err(task_error)?;

        let mut results = Vec::with_capacity(payload.prompts.len());
        for prompt in &payload.prompts {
            let answer = self
                .orchestrator
                .query(&resources, prompt)
                .await
                .map_err(task_error)?;
            results.push(answer);
        }

        let mut result = serde_json::json!({
            "result": results,
            "session_id": payload.session_id,
        });

        if let Some(config) = &payload.webhook {
            let report = self
                .webhook
                .deliver(
                    config,
                    &serde_json::json!({
                        "results": results,
                        "session_id": payload.session_id,
                    }),
                )
                .await;
            result["webhook"] =
                serde_json::to_value(&report).map_err(|e| TaskError::from_error(&e, false))?;
        }

        info!(session_id = %payload.session_id, prompts = payload.prompts.len(), "query task completed");
        Ok(result)
    }

    #[instrument(skip(self, payload), fields(session_id = %payload.session_id))]
    async fn run_close(&self, payload: CloseTaskPayload) -> Result<serde_json::Value, TaskError> {
        self.orchestrator
            .close(&payload.session_id)
            .await
            .map_err(task_error)?;

        Ok(serde_json::json!({
            "closed": true,
            "session_id": payload.session_id,
        }))
    }
}

#[async_trait]
impl TaskRouter for AssistantRouter {
    fn max_attempts(&self, kind: &str) -> u32 {
        match kind {
            QUERY_TASK => 2,
            CLOSE_TASK => 4,
            _ => 1,
        }
    }

    async fn run(
        &self,
        kind: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, TaskError> {
        match kind {
            QUERY_TASK => {
                let payload: QueryTaskPayload = parse_payload(payload)?;
                self.run_query(payload).await
            }
            CLOSE_TASK => {
                let payload: CloseTaskPayload = parse_payload(payload)?;
                self.run_close(payload).await
            }
            other => Err(TaskError::terminal(
                format!("unknown task kind: {other}"),
                format!("no handler registered for kind {other}"),
            )),
        }
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(
    payload: &serde_json::Value,
) -> Result<T, TaskError> {
    serde_json::from_value(payload.clone()).map_err(|e| TaskError::from_error(&e, false))
}

fn task_error(err: AssistantError) -> TaskError {
    let retryable = err.is_retryable();
    TaskError {
        message: err.to_string(),
        trace: error_chain(&err),
        retryable,
    }
}
