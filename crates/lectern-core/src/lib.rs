pub mod errors;
pub mod ids;
pub mod provider;
pub mod webhook;

pub use errors::ProviderError;
pub use provider::AssistantProvider;
pub use webhook::WebhookConfig;
