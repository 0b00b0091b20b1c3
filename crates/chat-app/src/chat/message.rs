use chrono::{DateTime, Utc};
use murmur_store::{MessageId, MessageRecord, MessageRecordPatch, MessageRole, NewMessageRecord};

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl From<MessageRole> for Role {
    fn from(role: MessageRole) -> Self {
        match role {
            MessageRole::System => Self::System,
            MessageRole::User => Self::User,
            MessageRole::Assistant => Self::Assistant,
        }
    }
}

impl From<Role> for MessageRole {
    fn from(role: Role) -> Self {
        match role {
            Role::System => Self::System,
            Role::User => Self::User,
            Role::Assistant => Self::Assistant,
        }
    }
}

impl From<Role> for murmur_llm::Role {
    fn from(role: Role) -> Self {
        match role {
            Role::System => Self::System,
            Role::User => Self::User,
            Role::Assistant => Self::Assistant,
        }
    }
}

/// One rendered conversation entry.
///
/// Born with a client-local id; when the store accepts a persisted twin, the
/// store-assigned id replaces the local one in place so later patches and
/// reconciliation pushes correlate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_streaming: bool,
    pub error: Option<String>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: MessageId::generate_local(),
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
            is_streaming: false,
            error: None,
        }
    }

    /// Assistant entry shown while the reply is still being generated.
    pub fn assistant_placeholder() -> Self {
        Self {
            id: MessageId::generate_local(),
            role: Role::Assistant,
            content: String::new(),
            timestamp: Utc::now(),
            is_streaming: true,
            error: None,
        }
    }

    pub fn from_record(record: MessageRecord) -> Self {
        Self {
            id: record.id,
            role: record.role.into(),
            content: record.content,
            timestamp: record.timestamp,
            is_streaming: record.is_streaming,
            error: record.error,
        }
    }

    pub fn to_new_record(&self) -> NewMessageRecord {
        NewMessageRecord {
            role: self.role.into(),
            content: self.content.clone(),
            timestamp: self.timestamp,
            is_streaming: self.is_streaming,
            error: self.error.clone(),
        }
    }
}

/// In-place field update for one message; `None` leaves the field untouched.
/// `error` is doubly optional so a patch can clear a recorded failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub is_streaming: Option<bool>,
    pub error: Option<Option<String>>,
}

impl MessagePatch {
    pub fn apply(&self, message: &mut ChatMessage) {
        if let Some(content) = &self.content {
            message.content = content.clone();
        }
        if let Some(timestamp) = self.timestamp {
            message.timestamp = timestamp;
        }
        if let Some(is_streaming) = self.is_streaming {
            message.is_streaming = is_streaming;
        }
        if let Some(error) = &self.error {
            message.error = error.clone();
        }
    }

    pub fn to_record_patch(&self) -> MessageRecordPatch {
        MessageRecordPatch {
            content: self.content.clone(),
            timestamp: self.timestamp,
            is_streaming: self.is_streaming,
            error: self.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_starts_streaming_and_empty() {
        let placeholder = ChatMessage::assistant_placeholder();
        assert_eq!(placeholder.role, Role::Assistant);
        assert!(placeholder.is_streaming);
        assert!(placeholder.content.is_empty());
        assert!(placeholder.id.is_local());
    }

    #[test]
    fn patch_clears_a_recorded_error() {
        let mut message = ChatMessage::assistant_placeholder();
        message.error = Some("boom".to_string());

        let patch = MessagePatch {
            error: Some(None),
            ..Default::default()
        };
        patch.apply(&mut message);

        assert_eq!(message.error, None);
    }

    #[test]
    fn record_round_trip_preserves_fields() {
        let message = ChatMessage::user("hello");
        let record = message.to_new_record();
        assert_eq!(record.role, MessageRole::User);
        assert_eq!(record.content, "hello");
        assert!(!record.is_streaming);
    }
}
