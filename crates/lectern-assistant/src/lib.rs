pub mod error;
pub mod orchestrator;
pub mod tasks;
pub mod webhook;

pub use error::AssistantError;
pub use orchestrator::{ResourceOrchestrator, SessionResources, DEFAULT_RUN_RETRIES};
pub use tasks::{AssistantRouter, CloseTaskPayload, QueryTaskPayload, CLOSE_TASK, QUERY_TASK};
pub use webhook::{DeliveryReport, WebhookDispatcher};
