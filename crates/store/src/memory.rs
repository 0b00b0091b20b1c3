use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;

use super::error::{StoreError, StoreResult};
use super::ids::{LOCAL_ID_PREFIX, MessageId, SessionId, UserId};
use super::subscription::WatcherHub;
use super::types::{
    MessageRecord, MessageRecordPatch, NewMessageRecord, SESSION_LIST_LIMIT, SessionRecord,
};
use super::{MessageSubscription, RepositoryGateway, SessionSubscription};

#[derive(Default)]
struct MemoryState {
    sessions: Vec<SessionRecord>,
    messages: HashMap<String, Vec<MessageRecord>>,
    next_seq: u64,
}

/// In-memory repository gateway with the same contract and push semantics as
/// the sqlite gateway. Backs tests and ephemeral runs.
#[derive(Clone)]
pub struct MemoryGateway {
    state: Arc<Mutex<MemoryState>>,
    session_watchers: Arc<WatcherHub<SessionRecord>>,
    message_watchers: Arc<WatcherHub<MessageRecord>>,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            session_watchers: WatcherHub::new(),
            message_watchers: WatcherHub::new(),
        }
    }

    /// Returns the number of persisted sessions; used by tests asserting that
    /// anonymous flows never touch the store.
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Total persisted messages across all sessions.
    pub fn message_count(&self) -> usize {
        self.lock().messages.values().map(Vec::len).sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().expect("memory gateway state poisoned")
    }

    fn snapshot_sessions(state: &MemoryState, owner: &UserId) -> Vec<SessionRecord> {
        let mut sessions: Vec<SessionRecord> = state
            .sessions
            .iter()
            .filter(|session| &session.user_id == owner)
            .cloned()
            .collect();
        sessions.sort_by(|left, right| right.updated_at.cmp(&left.updated_at));
        sessions.truncate(SESSION_LIST_LIMIT);
        sessions
    }

    fn snapshot_messages(state: &MemoryState, session_id: &SessionId) -> Vec<MessageRecord> {
        let mut messages = state
            .messages
            .get(session_id.as_str())
            .cloned()
            .unwrap_or_default();
        messages.sort_by(|left, right| {
            left.timestamp
                .cmp(&right.timestamp)
                .then(left.seq.cmp(&right.seq))
        });
        messages
    }

    fn push_session_change(&self, session_id: &SessionId, owner: &UserId) {
        let (messages, sessions) = {
            let state = self.lock();
            (
                Self::snapshot_messages(&state, session_id),
                Self::snapshot_sessions(&state, owner),
            )
        };
        self.message_watchers.push(session_id.as_str(), messages);
        self.session_watchers.push(owner.as_str(), sessions);
    }

    fn owner_of(&self, stage: &'static str, session_id: &SessionId) -> StoreResult<UserId> {
        self.lock()
            .sessions
            .iter()
            .find(|session| &session.id == session_id)
            .map(|session| session.user_id.clone())
            .ok_or_else(|| StoreError::NotFound {
                stage,
                entity: "session",
                id: session_id.to_string(),
            })
    }
}

#[async_trait::async_trait]
impl RepositoryGateway for MemoryGateway {
    async fn create_session(&self, owner: &UserId, title: &str) -> StoreResult<SessionRecord> {
        reject_local_id("create-session", owner.as_str())?;

        let now = Utc::now();
        let record = SessionRecord {
            id: SessionId::generate(),
            user_id: owner.clone(),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
            message_count: 0,
        };

        self.lock().sessions.push(record.clone());
        let sessions = Self::snapshot_sessions(&self.lock(), owner);
        self.session_watchers.push(owner.as_str(), sessions);
        Ok(record)
    }

    async fn list_sessions(&self, owner: &UserId) -> StoreResult<Vec<SessionRecord>> {
        Ok(Self::snapshot_sessions(&self.lock(), owner))
    }

    async fn subscribe_sessions(&self, owner: &UserId) -> StoreResult<SessionSubscription> {
        let initial = Self::snapshot_sessions(&self.lock(), owner);
        Ok(self.session_watchers.subscribe(owner.as_str(), initial))
    }

    async fn subscribe_messages(
        &self,
        session_id: &SessionId,
    ) -> StoreResult<MessageSubscription> {
        let initial = Self::snapshot_messages(&self.lock(), session_id);
        Ok(self.message_watchers.subscribe(session_id.as_str(), initial))
    }

    async fn add_message(
        &self,
        session_id: &SessionId,
        input: NewMessageRecord,
    ) -> StoreResult<MessageRecord> {
        reject_local_id("add-message", session_id.as_str())?;
        let owner = self.owner_of("add-message", session_id)?;

        let record = {
            let mut state = self.lock();
            state.next_seq += 1;
            let record = MessageRecord {
                id: MessageId::generate(),
                session_id: session_id.clone(),
                seq: state.next_seq,
                role: input.role,
                content: input.content,
                timestamp: input.timestamp,
                is_streaming: input.is_streaming,
                error: input.error,
            };
            state
                .messages
                .entry(session_id.to_string())
                .or_default()
                .push(record.clone());

            if let Some(session) = state
                .sessions
                .iter_mut()
                .find(|session| &session.id == session_id)
            {
                session.message_count += 1;
                session.updated_at = Utc::now();
            }
            record
        };

        self.push_session_change(session_id, &owner);
        Ok(record)
    }

    async fn update_message(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
        patch: MessageRecordPatch,
    ) -> StoreResult<()> {
        reject_local_id("update-message", session_id.as_str())?;
        let owner = self.owner_of("update-message", session_id)?;

        {
            let mut state = self.lock();
            let message = state
                .messages
                .get_mut(session_id.as_str())
                .and_then(|messages| {
                    messages
                        .iter_mut()
                        .find(|message| &message.id == message_id)
                })
                .ok_or_else(|| StoreError::NotFound {
                    stage: "update-message",
                    entity: "message",
                    id: message_id.to_string(),
                })?;

            if let Some(content) = patch.content {
                message.content = content;
            }
            if let Some(timestamp) = patch.timestamp {
                message.timestamp = timestamp;
            }
            if let Some(is_streaming) = patch.is_streaming {
                message.is_streaming = is_streaming;
            }
            if let Some(error) = patch.error {
                message.error = error;
            }
        }

        self.push_session_change(session_id, &owner);
        Ok(())
    }

    async fn update_session_title(&self, session_id: &SessionId, title: &str) -> StoreResult<()> {
        reject_local_id("update-session-title", session_id.as_str())?;
        let owner = self.owner_of("update-session-title", session_id)?;

        {
            let mut state = self.lock();
            if let Some(session) = state
                .sessions
                .iter_mut()
                .find(|session| &session.id == session_id)
            {
                session.title = title.to_string();
                session.updated_at = Utc::now();
            }
        }

        let sessions = Self::snapshot_sessions(&self.lock(), &owner);
        self.session_watchers.push(owner.as_str(), sessions);
        Ok(())
    }

    async fn update_session_message_count(
        &self,
        session_id: &SessionId,
        count: u32,
    ) -> StoreResult<()> {
        reject_local_id("update-session-message-count", session_id.as_str())?;
        let owner = self.owner_of("update-session-message-count", session_id)?;

        {
            let mut state = self.lock();
            if let Some(session) = state
                .sessions
                .iter_mut()
                .find(|session| &session.id == session_id)
            {
                session.message_count = count;
            }
        }

        let sessions = Self::snapshot_sessions(&self.lock(), &owner);
        self.session_watchers.push(owner.as_str(), sessions);
        Ok(())
    }

    async fn delete_session(&self, session_id: &SessionId) -> StoreResult<()> {
        reject_local_id("delete-session", session_id.as_str())?;
        let owner = self.owner_of("delete-session", session_id)?;

        {
            let mut state = self.lock();
            state.messages.remove(session_id.as_str());
            state.sessions.retain(|session| &session.id != session_id);
        }

        self.push_session_change(session_id, &owner);
        Ok(())
    }
}

fn reject_local_id(stage: &'static str, raw: &str) -> StoreResult<()> {
    if raw.starts_with(LOCAL_ID_PREFIX) {
        return Err(StoreError::LocalOnlyId {
            stage,
            id: raw.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::super::SubscriptionEvent;
    use super::super::types::MessageRole;
    use super::*;

    fn owner() -> UserId {
        UserId::new("user-1")
    }

    fn new_message(content: &str, seconds: u32) -> NewMessageRecord {
        NewMessageRecord {
            role: MessageRole::User,
            content: content.to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, seconds).unwrap(),
            is_streaming: false,
            error: None,
        }
    }

    #[tokio::test]
    async fn timestamp_ties_resolve_by_insertion_order() {
        let gateway = MemoryGateway::new();
        let session = gateway.create_session(&owner(), "ties").await.unwrap();

        gateway
            .add_message(&session.id, new_message("first", 1))
            .await
            .unwrap();
        gateway
            .add_message(&session.id, new_message("second", 1))
            .await
            .unwrap();

        let mut subscription = gateway.subscribe_messages(&session.id).await.unwrap();
        let Some(SubscriptionEvent::Snapshot(snapshot)) = subscription.try_recv() else {
            panic!("expected initial snapshot");
        };
        assert_eq!(snapshot[0].content, "first");
        assert_eq!(snapshot[1].content, "second");
    }

    #[tokio::test]
    async fn delete_session_removes_messages_and_record() {
        let gateway = MemoryGateway::new();
        let session = gateway.create_session(&owner(), "doomed").await.unwrap();
        gateway
            .add_message(&session.id, new_message("gone", 0))
            .await
            .unwrap();

        gateway.delete_session(&session.id).await.unwrap();

        assert_eq!(gateway.session_count(), 0);
        assert_eq!(gateway.message_count(), 0);
    }

    #[tokio::test]
    async fn message_count_override_is_stored_and_pushed() {
        let gateway = MemoryGateway::new();
        let session = gateway.create_session(&owner(), "count").await.unwrap();
        gateway
            .add_message(&session.id, new_message("one", 0))
            .await
            .unwrap();

        let mut subscription = gateway.subscribe_sessions(&owner()).await.unwrap();
        let _ = subscription.try_recv();

        gateway
            .update_session_message_count(&session.id, 3)
            .await
            .unwrap();

        let sessions = gateway.list_sessions(&owner()).await.unwrap();
        assert_eq!(sessions[0].message_count, 3);

        let Some(SubscriptionEvent::Snapshot(snapshot)) = subscription.try_recv() else {
            panic!("expected change push");
        };
        assert_eq!(snapshot[0].message_count, 3);
    }

    #[tokio::test]
    async fn session_subscription_sees_title_update() {
        let gateway = MemoryGateway::new();
        let session = gateway.create_session(&owner(), "before").await.unwrap();

        let mut subscription = gateway.subscribe_sessions(&owner()).await.unwrap();
        let _ = subscription.try_recv();

        gateway
            .update_session_title(&session.id, "after")
            .await
            .unwrap();

        let Some(SubscriptionEvent::Snapshot(snapshot)) = subscription.try_recv() else {
            panic!("expected change push");
        };
        assert_eq!(snapshot[0].title, "after");
    }
}
