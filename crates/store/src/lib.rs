pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod subscription;
pub mod types;

use async_trait::async_trait;

pub use error::{StoreError, StoreResult};
pub use ids::{LOCAL_ID_PREFIX, MessageId, SessionId, UserId};
pub use memory::MemoryGateway;
pub use sqlite::SqliteGateway;
pub use subscription::{Subscription, SubscriptionEvent};
pub use types::{
    DEFAULT_SESSION_TITLE, MessageRecord, MessageRecordPatch, MessageRole, NewMessageRecord,
    SESSION_LIST_LIMIT, SessionRecord,
};

pub type SessionSubscription = Subscription<SessionRecord>;
pub type MessageSubscription = Subscription<MessageRecord>;

/// Durable session/message storage with real-time snapshot push.
///
/// Implementations own ordering: sessions list descending by `updated_at`,
/// messages ascending by `(timestamp, seq)` where `seq` is the insertion
/// counter breaking timestamp ties. Subscriptions deliver the full current
/// snapshot immediately and again after every change to the watched entity.
#[async_trait]
pub trait RepositoryGateway: Send + Sync {
    async fn create_session(&self, owner: &UserId, title: &str) -> StoreResult<SessionRecord>;

    /// Most recently updated first, capped at [`SESSION_LIST_LIMIT`].
    async fn list_sessions(&self, owner: &UserId) -> StoreResult<Vec<SessionRecord>>;

    async fn subscribe_sessions(&self, owner: &UserId) -> StoreResult<SessionSubscription>;

    async fn subscribe_messages(&self, session_id: &SessionId)
    -> StoreResult<MessageSubscription>;

    /// Appends a message with a store-assigned id; bumps the session's
    /// `message_count` and `updated_at` as a side effect.
    async fn add_message(
        &self,
        session_id: &SessionId,
        input: NewMessageRecord,
    ) -> StoreResult<MessageRecord>;

    async fn update_message(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
        patch: MessageRecordPatch,
    ) -> StoreResult<()>;

    async fn update_session_title(&self, session_id: &SessionId, title: &str) -> StoreResult<()>;

    async fn update_session_message_count(
        &self,
        session_id: &SessionId,
        count: u32,
    ) -> StoreResult<()>;

    /// Deletes all persisted messages of the session before removing the
    /// session record itself.
    async fn delete_session(&self, session_id: &SessionId) -> StoreResult<()>;
}
