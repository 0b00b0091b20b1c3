use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use murmur_store::{MessageId, SessionId, SessionRecord};

use super::message::{ChatMessage, MessagePatch};

/// Lifecycle of the message list for the current selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Unselected,
    /// Selection made, subscription not yet delivering.
    Loading,
    Live,
}

/// Owns the session list, the current selection, and the ordered message list
/// for the selected session.
///
/// Exactly two writers funnel through this API: the controller's optimistic
/// path and the gateway subscription's reconciliation path. Reconciliation is
/// gated by a fingerprint of the last-applied list state so store echoes of
/// writes the client just made do not churn the rendered list.
pub struct SessionStore {
    sessions: Vec<SessionRecord>,
    selected: Option<SessionId>,
    messages: Vec<ChatMessage>,
    phase: SessionPhase,
    fingerprint: u64,
    store_error: Option<String>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Vec::new(),
            selected: None,
            messages: Vec::new(),
            phase: SessionPhase::Unselected,
            fingerprint: list_fingerprint(&[]),
            store_error: None,
        }
    }

    pub fn sessions(&self) -> &[SessionRecord] {
        &self.sessions
    }

    pub fn session(&self, session_id: &SessionId) -> Option<&SessionRecord> {
        self.sessions.iter().find(|session| &session.id == session_id)
    }

    pub fn selected(&self) -> Option<&SessionId> {
        self.selected.as_ref()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Last surfaced subscription failure, cleared on re-selection.
    pub fn store_error(&self) -> Option<&str> {
        self.store_error.as_deref()
    }

    /// Switches the active session and resets all per-selection state.
    ///
    /// The message list always starts empty; persisted history arrives through
    /// the fresh subscription, local-only sessions simply have none.
    pub fn select_session(&mut self, target: Option<SessionId>) {
        self.selected = target;
        self.messages.clear();
        self.store_error = None;
        self.phase = if self.selected.is_some() {
            SessionPhase::Loading
        } else {
            SessionPhase::Unselected
        };
        self.refresh_fingerprint();
    }

    /// Marks the selection live without waiting for a subscription, used for
    /// local-only sessions that have no remote side.
    pub fn mark_live(&mut self) {
        if self.selected.is_some() {
            self.phase = SessionPhase::Live;
        }
    }

    /// Appends a message immediately for caller-side latency hiding, keeping
    /// the owning session's `message_count` in step.
    ///
    /// Silently dropped when the selection moved since the caller scheduled
    /// the append; returns whether the message landed.
    pub fn apply_optimistic_message(
        &mut self,
        session_id: &SessionId,
        message: ChatMessage,
    ) -> bool {
        if self.selected.as_ref() != Some(session_id) {
            tracing::debug!(
                session_id = %session_id,
                "dropping optimistic message for a stale selection"
            );
            return false;
        }

        self.messages.push(message);
        self.refresh_fingerprint();
        if let Some(session) = self
            .sessions
            .iter_mut()
            .find(|session| &session.id == session_id)
        {
            session.message_count += 1;
        }
        true
    }

    /// Replaces the local list with a remote snapshot, unless the snapshot
    /// fingerprint matches the last-applied list state.
    ///
    /// Returns whether a replace happened. An echo of writes the client just
    /// made hashes identically and is suppressed, so optimistic entries the
    /// store has already accepted are never churned; a genuinely divergent
    /// snapshot replaces the list wholesale.
    pub fn reconcile(&mut self, remote: Vec<ChatMessage>) -> bool {
        self.phase = SessionPhase::Live;

        let next = list_fingerprint(&remote);
        if next == self.fingerprint {
            return false;
        }

        self.messages = remote;
        self.fingerprint = next;

        let count = self.messages.len() as u32;
        if let Some(selected) = self.selected.clone() {
            self.set_session_message_count(&selected, count);
        }
        true
    }

    /// Patches one message in place; returns false when out of bounds.
    pub fn mutate_message(&mut self, index: usize, patch: &MessagePatch) -> bool {
        let Some(message) = self.messages.get_mut(index) else {
            return false;
        };
        patch.apply(message);
        self.refresh_fingerprint();
        true
    }

    /// Swaps a local id for the store-assigned one after a persisted write,
    /// so reconciliation pushes and later patches correlate.
    pub fn adopt_store_id(&mut self, index: usize, id: MessageId) -> bool {
        let Some(message) = self.messages.get_mut(index) else {
            return false;
        };
        message.id = id;
        self.refresh_fingerprint();
        true
    }

    /// Degrades to an empty list with the failure surfaced; recovery is a
    /// fresh selection.
    pub fn fail_subscription(&mut self, reason: impl Into<String>) {
        self.messages.clear();
        self.store_error = Some(reason.into());
        self.refresh_fingerprint();
    }

    /// Same degradation for the session list when its feed dies; recovery is
    /// a reconnect.
    pub fn fail_session_subscription(&mut self, reason: impl Into<String>) {
        self.sessions.clear();
        self.store_error = Some(reason.into());
    }

    pub fn set_sessions(&mut self, sessions: Vec<SessionRecord>) {
        self.sessions = sessions;
    }

    /// Inserts or replaces one session record, keeping it visible in the list
    /// ahead of gateway pushes.
    pub fn upsert_session(&mut self, record: SessionRecord) {
        if let Some(existing) = self
            .sessions
            .iter_mut()
            .find(|session| session.id == record.id)
        {
            *existing = record;
        } else {
            self.sessions.insert(0, record);
        }
    }

    pub fn set_session_message_count(&mut self, session_id: &SessionId, count: u32) {
        if let Some(session) = self
            .sessions
            .iter_mut()
            .find(|session| &session.id == session_id)
        {
            session.message_count = count;
        }
    }

    pub fn set_session_title(&mut self, session_id: &SessionId, title: &str) {
        if let Some(session) = self
            .sessions
            .iter_mut()
            .find(|session| &session.id == session_id)
        {
            session.title = title.to_string();
        }
    }

    pub fn remove_session(&mut self, session_id: &SessionId) {
        self.sessions.retain(|session| &session.id != session_id);
    }

    /// Most recently updated remaining session, used as the fallback target
    /// after deleting the selected one.
    pub fn most_recent_session(&self) -> Option<SessionId> {
        self.sessions
            .iter()
            .max_by_key(|session| session.updated_at)
            .map(|session| session.id.clone())
    }

    fn refresh_fingerprint(&mut self) {
        self.fingerprint = list_fingerprint(&self.messages);
    }
}

/// Order-sensitive digest over `(id, content length, streaming flag)`.
///
/// Content length is a cheap proxy for full equality: every meaningful
/// mutation in this domain changes the length, the id, or the flag.
fn list_fingerprint(messages: &[ChatMessage]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for message in messages {
        message.id.as_str().hash(&mut hasher);
        message.content.len().hash(&mut hasher);
        message.is_streaming.hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use murmur_store::UserId;

    use super::*;

    fn session_record(id: &SessionId, title: &str) -> SessionRecord {
        SessionRecord {
            id: id.clone(),
            user_id: UserId::new("user-1"),
            title: title.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            message_count: 0,
        }
    }

    fn select(store: &mut SessionStore) -> SessionId {
        let id = SessionId::generate();
        store.select_session(Some(id.clone()));
        id
    }

    #[test]
    fn echoed_snapshot_is_suppressed() {
        let mut store = SessionStore::new();
        let session_id = select(&mut store);

        let user = ChatMessage::user("hello");
        store.apply_optimistic_message(&session_id, user.clone());

        // The store echoes back exactly what we applied.
        assert!(!store.reconcile(vec![user]));
        assert_eq!(store.messages().len(), 1);
    }

    #[test]
    fn divergent_snapshot_replaces_the_list() {
        let mut store = SessionStore::new();
        let session_id = select(&mut store);

        let user = ChatMessage::user("hello");
        store.apply_optimistic_message(&session_id, user.clone());

        let mut remote = user.clone();
        remote.content = "hello there".to_string();
        assert!(store.reconcile(vec![remote.clone()]));
        assert_eq!(store.messages()[0].content, "hello there");
    }

    #[test]
    fn optimistic_append_for_stale_selection_is_dropped() {
        let mut store = SessionStore::new();
        let first = select(&mut store);
        let _second = select(&mut store);

        assert!(!store.apply_optimistic_message(&first, ChatMessage::user("late")));
        assert!(store.messages().is_empty());
    }

    #[test]
    fn selection_resets_messages_phase_and_error() {
        let mut store = SessionStore::new();
        let session_id = select(&mut store);
        store.apply_optimistic_message(&session_id, ChatMessage::user("hi"));
        store.fail_subscription("push channel closed");

        select(&mut store);
        assert!(store.messages().is_empty());
        assert_eq!(store.phase(), SessionPhase::Loading);
        assert_eq!(store.store_error(), None);

        store.select_session(None);
        assert_eq!(store.phase(), SessionPhase::Unselected);
    }

    #[test]
    fn mutation_refreshes_the_fingerprint() {
        let mut store = SessionStore::new();
        let session_id = select(&mut store);

        let mut placeholder = ChatMessage::assistant_placeholder();
        store.apply_optimistic_message(&session_id, placeholder.clone());

        let patch = MessagePatch {
            content: Some("done".to_string()),
            is_streaming: Some(false),
            ..Default::default()
        };
        assert!(store.mutate_message(0, &patch));

        // An echo of the mutated state must now be suppressed.
        patch.apply(&mut placeholder);
        assert!(!store.reconcile(vec![placeholder]));
    }

    #[test]
    fn adopting_a_store_id_keeps_the_echo_suppressed() {
        let mut store = SessionStore::new();
        let session_id = select(&mut store);

        let mut user = ChatMessage::user("hello");
        store.apply_optimistic_message(&session_id, user.clone());

        let store_id = MessageId::generate();
        assert!(store.adopt_store_id(0, store_id.clone()));

        user.id = store_id;
        assert!(!store.reconcile(vec![user]));
    }

    #[test]
    fn subscription_failure_empties_and_surfaces() {
        let mut store = SessionStore::new();
        let session_id = select(&mut store);
        store.apply_optimistic_message(&session_id, ChatMessage::user("hi"));

        store.fail_subscription("push channel closed");
        assert!(store.messages().is_empty());
        assert_eq!(store.store_error(), Some("push channel closed"));
    }

    #[test]
    fn optimistic_appends_keep_the_session_count_in_step() {
        let mut store = SessionStore::new();
        let session_id = SessionId::generate();
        store.upsert_session(session_record(&session_id, "count"));
        store.select_session(Some(session_id.clone()));

        store.apply_optimistic_message(&session_id, ChatMessage::user("one"));
        store.apply_optimistic_message(&session_id, ChatMessage::assistant_placeholder());
        assert_eq!(store.session(&session_id).unwrap().message_count, 2);

        // A divergent snapshot resets the count to what actually survived.
        assert!(store.reconcile(vec![ChatMessage::user("only")]));
        assert_eq!(store.session(&session_id).unwrap().message_count, 1);
    }

    #[test]
    fn session_feed_failure_empties_and_surfaces() {
        let mut store = SessionStore::new();
        store.upsert_session(session_record(&SessionId::generate(), "stale"));

        store.fail_session_subscription("push channel closed");
        assert!(store.sessions().is_empty());
        assert_eq!(store.store_error(), Some("push channel closed"));
    }

    #[test]
    fn most_recent_session_prefers_latest_update() {
        let mut store = SessionStore::new();
        let older = SessionId::generate();
        let newer = SessionId::generate();

        let mut first = session_record(&older, "older");
        first.updated_at = Utc::now() - chrono::Duration::minutes(5);
        store.upsert_session(first);
        store.upsert_session(session_record(&newer, "newer"));

        assert_eq!(store.most_recent_session(), Some(newer.clone()));

        store.remove_session(&newer);
        assert_eq!(store.most_recent_session(), Some(older));
    }

    #[test]
    fn out_of_bounds_mutation_is_rejected() {
        let mut store = SessionStore::new();
        select(&mut store);
        assert!(!store.mutate_message(0, &MessagePatch::default()));
    }
}
