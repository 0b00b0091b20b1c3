use rig::completion::CompletionModel;
use rig::message::AssistantContent;
use rig::prelude::CompletionClient as _;
use rig::providers::openai;
use snafu::{ResultExt, ensure};
use tokio::sync::oneshot;

use super::client::{
    CompletionClient, CompletionError, CompletionMessage, CompletionRequest, CompletionResult,
    CompletionTicket, CompletionsFailedSnafu, EmptyMessageSetSnafu, EmptyReplySnafu,
    CompletionHandle, HttpClientSnafu, MissingApiKeySnafu, ProviderConfig, Role,
};

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

/// Rig-backed OpenAI completion client.
///
/// Resolves a full reply per request; cancellation stops the wait without
/// unwinding whatever the provider completes server-side.
pub struct RigCompletionClient {
    config: ProviderConfig,
}

impl RigCompletionClient {
    pub fn new(config: ProviderConfig) -> CompletionResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-client-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self { config })
    }

    pub fn default_model(&self) -> &str {
        self.config
            .default_model
            .as_deref()
            .unwrap_or(DEFAULT_OPENAI_MODEL)
    }

    fn build_client(config: &ProviderConfig) -> CompletionResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.base_url.is_empty() {
            builder = builder.base_url(config.base_url.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn to_rig_message(message: &CompletionMessage) -> Option<rig::completion::Message> {
        match message.role {
            Role::System => None,
            Role::User => Some(rig::completion::Message::user(message.content.clone())),
            Role::Assistant => Some(rig::completion::Message::assistant(message.content.clone())),
        }
    }

    /// Rig exposes a single preamble field, so system-role messages are folded
    /// into it while user/assistant turns travel as chat messages.
    fn merged_preamble(request: &CompletionRequest) -> Option<String> {
        let mut preamble_parts = Vec::new();

        if let Some(preamble) = &request.preamble
            && !preamble.trim().is_empty()
        {
            preamble_parts.push(preamble.clone());
        }

        for message in &request.messages {
            if matches!(message.role, Role::System) && !message.content.trim().is_empty() {
                preamble_parts.push(message.content.clone());
            }
        }

        if preamble_parts.is_empty() {
            None
        } else {
            Some(preamble_parts.join("\n\n"))
        }
    }

    async fn request_reply(
        config: &ProviderConfig,
        request: &CompletionRequest,
    ) -> CompletionResult<String> {
        let client = Self::build_client(config)?;
        let model = client.completion_model(request.model_id.clone());

        let mut messages = request
            .messages
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = messages.pop() else {
            tracing::warn!(
                model_id = %request.model_id,
                total_message_count = request.messages.len(),
                "no user/assistant messages remain after filtering"
            );
            return EmptyMessageSetSnafu {
                stage: "request-reply-filter-messages",
            }
            .fail();
        };

        let mut builder = model.completion_request(prompt).messages(messages);

        if let Some(preamble) = Self::merged_preamble(request) {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        let response = builder.send().await.context(CompletionsFailedSnafu {
            stage: "send-completion",
        })?;

        let reply = response
            .choice
            .iter()
            .filter_map(|content| match content {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        ensure!(
            !reply.trim().is_empty(),
            EmptyReplySnafu {
                stage: "read-completion-reply",
                model_id: request.model_id.clone(),
            }
        );

        Ok(reply)
    }

    async fn run_worker(
        config: ProviderConfig,
        request: CompletionRequest,
        reply_tx: oneshot::Sender<CompletionResult<String>>,
        cancel_rx: oneshot::Receiver<()>,
    ) {
        tokio::select! {
            _ = cancel_rx => {
                // Dropping reply_tx tells the handle the worker went away.
                tracing::debug!(model_id = %request.model_id, "completion cancelled");
            }
            outcome = Self::request_reply(&config, &request) => {
                if let Err(error) = &outcome {
                    tracing::error!(
                        provider_id = %config.provider_id,
                        model_id = %request.model_id,
                        error = %error,
                        "completion request failed"
                    );
                }
                let _ = reply_tx.send(outcome);
            }
        }
    }
}

impl CompletionClient for RigCompletionClient {
    fn complete(&self, request: CompletionRequest) -> CompletionResult<CompletionTicket> {
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu { stage: "complete" }
        );

        let (reply_tx, cancel_rx, handle) = CompletionHandle::channel();
        let worker = Box::pin(Self::run_worker(
            self.config.clone(),
            request,
            reply_tx,
            cancel_rx,
        ));

        Ok(CompletionTicket { handle, worker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(role: Role, content: &str) -> CompletionMessage {
        CompletionMessage::new(role, content)
    }

    #[test]
    fn system_messages_fold_into_preamble() {
        let request = CompletionRequest::new(
            "model",
            vec![message(Role::System, "be brief"), message(Role::User, "hi")],
        )
        .with_preamble("you are murmur");

        assert_eq!(
            RigCompletionClient::merged_preamble(&request).as_deref(),
            Some("you are murmur\n\nbe brief")
        );
    }

    #[test]
    fn preamble_is_absent_without_system_content() {
        let request = CompletionRequest::new("model", vec![message(Role::User, "hi")]);
        assert_eq!(RigCompletionClient::merged_preamble(&request), None);
    }

    #[test]
    fn system_role_is_excluded_from_chat_messages() {
        assert!(RigCompletionClient::to_rig_message(&message(Role::System, "x")).is_none());
        assert!(RigCompletionClient::to_rig_message(&message(Role::User, "x")).is_some());
        assert!(RigCompletionClient::to_rig_message(&message(Role::Assistant, "x")).is_some());
    }

    #[test]
    fn missing_api_key_is_rejected_at_construction() {
        let config = ProviderConfig::new("openai", "", "", None);
        assert!(matches!(
            RigCompletionClient::new(config),
            Err(CompletionError::MissingApiKey { .. })
        ));
    }

    #[test]
    fn empty_request_is_rejected_before_spawn() {
        let config = ProviderConfig::new("openai", "key", "", None);
        let client = RigCompletionClient::new(config).unwrap();
        assert!(matches!(
            client.complete(CompletionRequest::new("model", Vec::new())),
            Err(CompletionError::EmptyMessageSet { .. })
        ));
    }
}
