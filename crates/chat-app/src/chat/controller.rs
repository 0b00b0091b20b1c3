use std::sync::Arc;

use chrono::Utc;
use murmur_llm::{CompletionClient, CompletionMessage, CompletionRequest, CompletionTicket};
use murmur_store::{
    DEFAULT_SESSION_TITLE, MessageSubscription, RepositoryGateway, SessionId, SessionRecord,
    SessionSubscription, SubscriptionEvent, UserId,
};

use super::message::{ChatMessage, MessagePatch, Role};
use super::session_store::SessionStore;
use super::title::derive_title;

/// Shown in place of the assistant reply when the completion fails.
pub const REPLY_FAILED_TEXT: &str = "Sorry, I couldn't get a response. Please try again.";

/// One in-flight completion turn: where its placeholder lives and the handle
/// that resolves or cancels it.
struct ActiveTurn {
    session_id: SessionId,
    placeholder_index: usize,
    handle: murmur_llm::CompletionHandle,
}

/// Top-level conversation orchestration.
///
/// Identity is an explicit dependency: persistence applies only when an
/// identity is present and the session id is not local-only. All user-facing
/// operations treat violated preconditions as silent no-ops, convert
/// completion failures into assistant-visible error messages, and log-and-
/// swallow gateway write failures so local state stays authoritative.
pub struct ChatController {
    identity: Option<UserId>,
    gateway: Arc<dyn RepositoryGateway>,
    completion: Arc<dyn CompletionClient>,
    model_id: String,
    store: SessionStore,
    session_subscription: Option<SessionSubscription>,
    message_subscription: Option<MessageSubscription>,
    active_turn: Option<ActiveTurn>,
}

impl ChatController {
    pub fn new(
        identity: Option<UserId>,
        gateway: Arc<dyn RepositoryGateway>,
        completion: Arc<dyn CompletionClient>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            identity,
            gateway,
            completion,
            model_id: model_id.into(),
            store: SessionStore::new(),
            session_subscription: None,
            message_subscription: None,
            active_turn: None,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn is_generating(&self) -> bool {
        self.active_turn.is_some()
    }

    fn persists(&self, session_id: &SessionId) -> bool {
        self.identity.is_some() && !session_id.is_local()
    }

    /// Subscribes to the identity's session list; anonymous runs skip the
    /// gateway entirely.
    pub async fn connect(&mut self) {
        let Some(owner) = self.identity.clone() else {
            return;
        };

        match self.gateway.subscribe_sessions(&owner).await {
            Ok(mut subscription) => {
                if let Some(SubscriptionEvent::Snapshot(sessions)) = subscription.try_recv() {
                    self.store.set_sessions(sessions);
                }
                self.session_subscription = Some(subscription);
            }
            Err(error) => {
                tracing::error!(owner = %owner, error = %error, "failed to subscribe to sessions");
                self.store.fail_session_subscription(error.to_string());
            }
        }
    }

    /// Drains pending subscription pushes into the store. Called by the
    /// surface before each render; cheap when nothing arrived.
    pub fn pump(&mut self) {
        let mut session_events = Vec::new();
        if let Some(subscription) = &mut self.session_subscription {
            while let Some(event) = subscription.try_recv() {
                session_events.push(event);
            }
        }
        for event in session_events {
            match event {
                SubscriptionEvent::Snapshot(sessions) => self.store.set_sessions(sessions),
                SubscriptionEvent::Lost { reason } => {
                    tracing::error!(reason = %reason, "session subscription lost");
                    self.store.fail_session_subscription(reason);
                    self.session_subscription = None;
                }
            }
        }

        let mut message_events = Vec::new();
        if let Some(subscription) = &mut self.message_subscription {
            while let Some(event) = subscription.try_recv() {
                message_events.push(event);
            }
        }
        for event in message_events {
            match event {
                SubscriptionEvent::Snapshot(records) => {
                    let remote = records.into_iter().map(ChatMessage::from_record).collect();
                    self.store.reconcile(remote);
                }
                SubscriptionEvent::Lost { reason } => {
                    tracing::error!(reason = %reason, "message subscription lost");
                    self.store.fail_subscription(reason);
                    self.message_subscription = None;
                }
            }
        }
    }

    /// Starts one conversation turn from user text.
    ///
    /// Returns whether a turn actually started; empty input or an in-flight
    /// turn are silent no-ops. The started turn finishes in [`resolve_turn`].
    ///
    /// [`resolve_turn`]: Self::resolve_turn
    pub async fn send_message(&mut self, text: &str) -> bool {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            tracing::debug!("ignoring empty message");
            return false;
        }
        if self.active_turn.is_some() {
            tracing::debug!("a turn is already in flight, ignoring send");
            return false;
        }

        let session_id = match self.store.selected() {
            Some(id) => id.clone(),
            None => self.create_session().await,
        };

        // User message first, placeholder second; both visible before any
        // store write or network call.
        let user_index = self.store.messages().len();
        self.store
            .apply_optimistic_message(&session_id, ChatMessage::user(trimmed));
        let placeholder_index = self.store.messages().len();
        self.store
            .apply_optimistic_message(&session_id, ChatMessage::assistant_placeholder());

        if self.persists(&session_id) {
            self.persist_new_message(&session_id, user_index).await;
            self.persist_new_message(&session_id, placeholder_index).await;
        }

        let request = self.completion_request(&self.store.messages()[..placeholder_index]);
        self.start_turn(session_id, placeholder_index, request).await;
        true
    }

    /// Awaits the pending completion and applies its outcome to the
    /// placeholder. Returns false when the turn ended in a completion error;
    /// a no-op (nothing pending) counts as success.
    ///
    /// Dropping the returned future mid-wait leaves the turn pending, so a
    /// surface racing stdin against the reply can call again later.
    pub async fn resolve_turn(&mut self) -> bool {
        let outcome = match self.active_turn.as_mut() {
            Some(turn) => turn.handle.reply().await,
            None => return true,
        };
        let Some(turn) = self.active_turn.take() else {
            return true;
        };

        match outcome {
            Ok(text) => {
                let patch = MessagePatch {
                    content: Some(text),
                    timestamp: Some(Utc::now()),
                    is_streaming: Some(false),
                    error: Some(None),
                };
                self.apply_patch(&turn.session_id, turn.placeholder_index, patch)
                    .await;
                self.assign_title_if_needed(&turn.session_id).await;
                true
            }
            Err(error) => {
                tracing::error!(
                    session_id = %turn.session_id,
                    error = %error,
                    "completion failed"
                );
                let patch = MessagePatch {
                    content: Some(REPLY_FAILED_TEXT.to_string()),
                    timestamp: Some(Utc::now()),
                    is_streaming: Some(false),
                    error: Some(Some(error.to_string())),
                };
                self.apply_patch(&turn.session_id, turn.placeholder_index, patch)
                    .await;
                false
            }
        }
    }

    /// Regenerates the assistant message at `index` in place.
    ///
    /// The request is built from the history strictly before `index`; no new
    /// message is inserted. Out-of-bounds, non-assistant targets and in-flight
    /// turns are silent no-ops.
    pub async fn regenerate_response(&mut self, index: usize) -> bool {
        if self.active_turn.is_some() {
            return false;
        }
        let Some(session_id) = self.store.selected().cloned() else {
            return false;
        };
        match self.store.messages().get(index) {
            Some(message) if message.role == Role::Assistant => {}
            _ => return false,
        }

        let request = self.completion_request(&self.store.messages()[..index]);
        let patch = MessagePatch {
            content: Some(String::new()),
            timestamp: Some(Utc::now()),
            is_streaming: Some(true),
            error: Some(None),
        };
        self.apply_patch(&session_id, index, patch).await;
        self.start_turn(session_id, index, request).await;
        true
    }

    /// Replaces the content and timestamp of the message at `index`. Does not
    /// regenerate any downstream assistant reply.
    pub async fn edit_message(&mut self, index: usize, new_content: &str) -> bool {
        let trimmed = new_content.trim();
        if trimmed.is_empty() {
            return false;
        }
        let Some(session_id) = self.store.selected().cloned() else {
            return false;
        };
        if index >= self.store.messages().len() {
            return false;
        }

        let patch = MessagePatch {
            content: Some(trimmed.to_string()),
            timestamp: Some(Utc::now()),
            ..Default::default()
        };
        self.apply_patch(&session_id, index, patch).await;
        true
    }

    /// Best-effort cancellation of the in-flight turn.
    ///
    /// The placeholder freezes with whatever content it has; a reply that
    /// still lands server-side is discarded with the dropped handle.
    pub async fn stop_generation(&mut self) {
        let Some(mut turn) = self.active_turn.take() else {
            return;
        };
        turn.handle.cancel();

        let patch = MessagePatch {
            is_streaming: Some(false),
            ..Default::default()
        };
        self.apply_patch(&turn.session_id, turn.placeholder_index, patch)
            .await;
    }

    /// Creates a session (persisted when possible) and selects it.
    pub async fn create_new_session(&mut self) -> SessionId {
        self.create_session().await
    }

    /// Deletes a session; persisted messages cascade before the record goes.
    /// When the deleted session was selected, selection falls back to the
    /// next most-recent remaining session, or to none.
    pub async fn delete_session(&mut self, session_id: SessionId) {
        if self
            .active_turn
            .as_ref()
            .is_some_and(|turn| turn.session_id == session_id)
        {
            self.stop_generation().await;
        }

        if self.persists(&session_id) {
            if let Err(error) = self.gateway.delete_session(&session_id).await {
                tracing::warn!(
                    session_id = %session_id,
                    error = %error,
                    "failed to delete session remotely; removing locally"
                );
            }
        }

        let was_selected = self.store.selected() == Some(&session_id);
        self.store.remove_session(&session_id);

        if was_selected {
            let fallback = self.store.most_recent_session();
            self.select_session(fallback).await;
        }
    }

    /// Switches the selection, discarding the previous message subscription
    /// and opening a fresh one for persisted sessions.
    pub async fn select_session(&mut self, target: Option<SessionId>) {
        // Dropping the old subscription unsubscribes.
        self.message_subscription = None;
        self.store.select_session(target.clone());

        let Some(session_id) = target else {
            return;
        };
        if !self.persists(&session_id) {
            self.store.mark_live();
            return;
        }

        match self.gateway.subscribe_messages(&session_id).await {
            Ok(mut subscription) => {
                if let Some(SubscriptionEvent::Snapshot(records)) = subscription.try_recv() {
                    let remote = records.into_iter().map(ChatMessage::from_record).collect();
                    self.store.reconcile(remote);
                }
                self.store.mark_live();
                self.message_subscription = Some(subscription);
            }
            Err(error) => {
                tracing::error!(
                    session_id = %session_id,
                    error = %error,
                    "failed to subscribe to messages"
                );
                self.store.fail_subscription(error.to_string());
            }
        }
    }

    async fn create_session(&mut self) -> SessionId {
        if let Some(owner) = self.identity.clone() {
            match self
                .gateway
                .create_session(&owner, DEFAULT_SESSION_TITLE)
                .await
            {
                Ok(record) => {
                    let session_id = record.id.clone();
                    self.store.upsert_session(record);
                    self.select_session(Some(session_id.clone())).await;
                    return session_id;
                }
                Err(error) => {
                    tracing::warn!(
                        owner = %owner,
                        error = %error,
                        "failed to create persisted session, falling back to local-only"
                    );
                }
            }
        }

        let now = Utc::now();
        let record = SessionRecord {
            id: SessionId::generate_local(),
            user_id: self
                .identity
                .clone()
                .unwrap_or_else(|| UserId::new("anonymous")),
            title: DEFAULT_SESSION_TITLE.to_string(),
            created_at: now,
            updated_at: now,
            message_count: 0,
        };
        let session_id = record.id.clone();
        self.store.upsert_session(record);
        self.select_session(Some(session_id.clone())).await;
        session_id
    }

    async fn persist_new_message(&mut self, session_id: &SessionId, index: usize) {
        let Some(message) = self.store.messages().get(index) else {
            return;
        };
        let input = message.to_new_record();

        match self.gateway.add_message(session_id, input).await {
            Ok(record) => {
                self.store.adopt_store_id(index, record.id);
            }
            Err(error) => {
                tracing::warn!(
                    session_id = %session_id,
                    error = %error,
                    "failed to persist message; local state stays authoritative"
                );
                self.repair_message_count(session_id).await;
            }
        }
    }

    /// Pushes the authoritative local count after a message write was
    /// swallowed, so the persisted record does not stay behind the visible
    /// list.
    async fn repair_message_count(&mut self, session_id: &SessionId) {
        if self.store.selected() != Some(session_id) {
            return;
        }
        let count = self.store.messages().len() as u32;
        self.store.set_session_message_count(session_id, count);

        if let Err(error) = self
            .gateway
            .update_session_message_count(session_id, count)
            .await
        {
            tracing::warn!(
                session_id = %session_id,
                error = %error,
                "failed to repair session message count"
            );
        }
    }

    /// Applies a patch locally, then mirrors it to the store when the session
    /// is persisted and the message already has a store id.
    async fn apply_patch(&mut self, session_id: &SessionId, index: usize, patch: MessagePatch) {
        if self.store.selected() != Some(session_id) {
            tracing::debug!(session_id = %session_id, "selection moved on, dropping patch");
            return;
        }
        if !self.store.mutate_message(index, &patch) {
            return;
        }

        if !self.persists(session_id) {
            return;
        }
        let message_id = self.store.messages()[index].id.clone();
        if message_id.is_local() {
            return;
        }

        if let Err(error) = self
            .gateway
            .update_message(session_id, &message_id, patch.to_record_patch())
            .await
        {
            tracing::warn!(
                session_id = %session_id,
                message_id = %message_id,
                error = %error,
                "failed to persist message patch"
            );
        }
    }

    /// First completed exchange of an untitled session names it after the
    /// first non-empty user message.
    async fn assign_title_if_needed(&mut self, session_id: &SessionId) {
        let needs_title = self
            .store
            .session(session_id)
            .is_some_and(|session| {
                session.title.is_empty() || session.title == DEFAULT_SESSION_TITLE
            });
        if !needs_title {
            return;
        }

        let Some(source) = self
            .store
            .messages()
            .iter()
            .find(|message| message.role == Role::User && !message.content.trim().is_empty())
        else {
            return;
        };

        let title = derive_title(&source.content);
        self.store.set_session_title(session_id, &title);

        if self.persists(session_id)
            && let Err(error) = self.gateway.update_session_title(session_id, &title).await
        {
            tracing::warn!(
                session_id = %session_id,
                error = %error,
                "failed to persist session title"
            );
        }
    }

    fn completion_request(&self, history: &[ChatMessage]) -> CompletionRequest {
        let messages = history
            .iter()
            .filter(|message| !message.content.trim().is_empty())
            .map(|message| CompletionMessage::new(message.role.into(), message.content.clone()))
            .collect();
        CompletionRequest::new(self.model_id.clone(), messages)
    }

    async fn start_turn(
        &mut self,
        session_id: SessionId,
        placeholder_index: usize,
        request: CompletionRequest,
    ) {
        match self.completion.complete(request) {
            Ok(CompletionTicket { handle, worker }) => {
                tokio::spawn(worker);
                self.active_turn = Some(ActiveTurn {
                    session_id,
                    placeholder_index,
                    handle,
                });
            }
            Err(error) => {
                tracing::error!(
                    session_id = %session_id,
                    error = %error,
                    "failed to start completion"
                );
                let patch = MessagePatch {
                    content: Some(REPLY_FAILED_TEXT.to_string()),
                    timestamp: Some(Utc::now()),
                    is_streaming: Some(false),
                    error: Some(Some(error.to_string())),
                };
                self.apply_patch(&session_id, placeholder_index, patch).await;
            }
        }
    }
}
