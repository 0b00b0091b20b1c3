use chrono::{DateTime, Utc};

use super::ids::{MessageId, SessionId, UserId};

/// Default session title used before the first exchange derives a real one.
pub const DEFAULT_SESSION_TITLE: &str = "New Conversation";

/// Upper bound on sessions returned by a listing query.
pub const SESSION_LIST_LIMIT: usize = 50;

/// Store-local message role, intentionally decoupled from UI-layer role enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: SessionId,
    pub user_id: UserId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub session_id: SessionId,
    /// Insertion counter used as the timestamp tie-break.
    pub seq: u64,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_streaming: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessageRecord {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_streaming: bool,
    pub error: Option<String>,
}

/// Partial update for one message. `error` is doubly optional so a patch can
/// clear a previously recorded error.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageRecordPatch {
    pub content: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub is_streaming: Option<bool>,
    pub error: Option<Option<String>>,
}

impl MessageRecordPatch {
    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.timestamp.is_none()
            && self.is_streaming.is_none()
            && self.error.is_none()
    }
}
