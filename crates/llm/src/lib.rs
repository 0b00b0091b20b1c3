use std::sync::Arc;

mod client;
mod rig_adapter;

pub use client::{
    CompletionClient, CompletionError, CompletionHandle, CompletionMessage, CompletionRequest,
    CompletionResult, CompletionTicket, CompletionWorker, ProviderConfig, Role,
};
pub use rig_adapter::{DEFAULT_OPENAI_MODEL, RIG_OPENAI_PROVIDER_ID, RigCompletionClient};

pub fn create_client(mut config: ProviderConfig) -> CompletionResult<Arc<dyn CompletionClient>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
    }

    if matches!(config.provider_id.as_str(), "openai" | "rig-openai") {
        config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
        return Ok(Arc::new(RigCompletionClient::new(config)?));
    }

    Err(CompletionError::UnsupportedProvider {
        stage: "create-client",
        provider_id: config.provider_id,
    })
}
