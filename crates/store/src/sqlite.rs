use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use super::error::{
    CreateSqliteDirectorySnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu,
    SqlitePragmaSnafu, SqliteQuerySnafu, StoreError, StoreResult,
};
use super::ids::{MessageId, SessionId, UserId};
use super::subscription::WatcherHub;
use super::types::{
    MessageRecord, MessageRecordPatch, MessageRole, NewMessageRecord, SESSION_LIST_LIMIT,
    SessionRecord,
};
use super::{MessageSubscription, RepositoryGateway, SessionSubscription};

const IN_MEMORY_DATABASE_URL: &str = "sqlite::memory:";

/// Sqlite-backed repository gateway with in-process snapshot push.
///
/// One pooled connection keeps write ordering deterministic; every mutating
/// call re-queries the affected snapshot after commit and fans it out to the
/// registered watchers.
#[derive(Clone)]
pub struct SqliteGateway {
    pool: SqlitePool,
    session_watchers: Arc<WatcherHub<SessionRecord>>,
    message_watchers: Arc<WatcherHub<MessageRecord>>,
}

impl SqliteGateway {
    pub async fn open(database_location: &str) -> StoreResult<Self> {
        ensure_database_directory(database_location)?;
        Self::open_url(&normalize_database_url(database_location)).await
    }

    /// Opens a private in-memory database, used by tests and ephemeral runs.
    pub async fn open_in_memory() -> StoreResult<Self> {
        Self::open_url(IN_MEMORY_DATABASE_URL).await
    }

    async fn open_url(database_url: &str) -> StoreResult<Self> {
        let connect_options = SqliteConnectOptions::from_str(database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.to_string(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.to_string(),
            })?;

        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::info!(database_url, "opened sqlite session store");

        Ok(Self {
            pool,
            session_watchers: WatcherHub::new(),
            message_watchers: WatcherHub::new(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn query_sessions(&self, owner: &UserId) -> StoreResult<Vec<SessionRecord>> {
        let rows = sqlx::query(
            "SELECT id, user_id, title, created_at, updated_at, message_count \
             FROM sessions WHERE user_id = ? ORDER BY updated_at DESC, id LIMIT ?",
        )
        .bind(owner.as_str())
        .bind(SESSION_LIST_LIMIT as i64)
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "list-sessions",
        })?;

        rows.iter().map(session_from_row).collect()
    }

    async fn query_messages(&self, session_id: &SessionId) -> StoreResult<Vec<MessageRecord>> {
        let rows = sqlx::query(
            "SELECT seq, id, session_id, role, content, timestamp, is_streaming, error \
             FROM messages WHERE session_id = ? ORDER BY timestamp, seq",
        )
        .bind(session_id.as_str())
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "list-messages",
        })?;

        rows.iter().map(message_from_row).collect()
    }

    async fn query_session_owner(&self, session_id: &SessionId) -> StoreResult<UserId> {
        let row = sqlx::query("SELECT user_id FROM sessions WHERE id = ?")
            .bind(session_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "load-session-owner",
            })?;

        let row = row.ok_or_else(|| StoreError::NotFound {
            stage: "load-session-owner",
            entity: "session",
            id: session_id.to_string(),
        })?;

        Ok(UserId::new(row.get::<String, _>("user_id")))
    }

    /// Re-queries and pushes both the message snapshot of `session_id` and the
    /// owner's session list after a mutation touched them.
    async fn push_session_change(&self, session_id: &SessionId, owner: &UserId) -> StoreResult<()> {
        let messages = self.query_messages(session_id).await?;
        self.message_watchers.push(session_id.as_str(), messages);

        let sessions = self.query_sessions(owner).await?;
        self.session_watchers.push(owner.as_str(), sessions);
        Ok(())
    }
}

#[async_trait::async_trait]
impl RepositoryGateway for SqliteGateway {
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

        sqlx::query(
            "INSERT INTO sessions (id, user_id, title, created_at, updated_at, message_count) \
             VALUES (?, ?, ?, ?, ?, 0)",
        )
        .bind(record.id.as_str())
        .bind(record.user_id.as_str())
        .bind(record.title.as_str())
        .bind(encode_timestamp(record.created_at))
        .bind(encode_timestamp(record.updated_at))
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "create-session-insert",
        })?;

        let sessions = self.query_sessions(owner).await?;
        self.session_watchers.push(owner.as_str(), sessions);

        Ok(record)
    }

    async fn list_sessions(&self, owner: &UserId) -> StoreResult<Vec<SessionRecord>> {
        self.query_sessions(owner).await
    }

    async fn subscribe_sessions(&self, owner: &UserId) -> StoreResult<SessionSubscription> {
        let initial = self.query_sessions(owner).await?;
        Ok(self.session_watchers.subscribe(owner.as_str(), initial))
    }

    async fn subscribe_messages(
        &self,
        session_id: &SessionId,
    ) -> StoreResult<MessageSubscription> {
        let initial = self.query_messages(session_id).await?;
        Ok(self.message_watchers.subscribe(session_id.as_str(), initial))
    }

    async fn add_message(
        &self,
        session_id: &SessionId,
        input: NewMessageRecord,
    ) -> StoreResult<MessageRecord> {
        reject_local_id("add-message", session_id.as_str())?;
        let owner = self.query_session_owner(session_id).await?;

        let message_id = MessageId::generate();
        let inserted = sqlx::query(
            "INSERT INTO messages (id, session_id, role, content, timestamp, is_streaming, error) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(message_id.as_str())
        .bind(session_id.as_str())
        .bind(input.role.as_str())
        .bind(input.content.as_str())
        .bind(encode_timestamp(input.timestamp))
        .bind(input.is_streaming)
        .bind(input.error.as_deref())
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "add-message-insert",
        })?;

        sqlx::query(
            "UPDATE sessions SET message_count = message_count + 1, updated_at = ? WHERE id = ?",
        )
        .bind(encode_timestamp(Utc::now()))
        .bind(session_id.as_str())
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "add-message-bump-session",
        })?;

        self.push_session_change(session_id, &owner).await?;

        Ok(MessageRecord {
            id: message_id,
            session_id: session_id.clone(),
            seq: inserted.last_insert_rowid() as u64,
            role: input.role,
            content: input.content,
            timestamp: input.timestamp,
            is_streaming: input.is_streaming,
            error: input.error,
        })
    }

    async fn update_message(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
        patch: MessageRecordPatch,
    ) -> StoreResult<()> {
        reject_local_id("update-message", session_id.as_str())?;
        if patch.is_empty() {
            return Ok(());
        }

        let row = sqlx::query(
            "SELECT content, timestamp, is_streaming, error FROM messages \
             WHERE id = ? AND session_id = ?",
        )
        .bind(message_id.as_str())
        .bind(session_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "update-message-load",
        })?
        .ok_or_else(|| StoreError::NotFound {
            stage: "update-message-load",
            entity: "message",
            id: message_id.to_string(),
        })?;

        let content = patch
            .content
            .unwrap_or_else(|| row.get::<String, _>("content"));
        let timestamp = match patch.timestamp {
            Some(timestamp) => encode_timestamp(timestamp),
            None => row.get::<String, _>("timestamp"),
        };
        let is_streaming = patch
            .is_streaming
            .unwrap_or_else(|| row.get::<bool, _>("is_streaming"));
        let error = match patch.error {
            Some(error) => error,
            None => row.get::<Option<String>, _>("error"),
        };

        sqlx::query(
            "UPDATE messages SET content = ?, timestamp = ?, is_streaming = ?, error = ? \
             WHERE id = ? AND session_id = ?",
        )
        .bind(content.as_str())
        .bind(timestamp.as_str())
        .bind(is_streaming)
        .bind(error.as_deref())
        .bind(message_id.as_str())
        .bind(session_id.as_str())
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "update-message-write",
        })?;

        let owner = self.query_session_owner(session_id).await?;
        self.push_session_change(session_id, &owner).await
    }

    async fn update_session_title(&self, session_id: &SessionId, title: &str) -> StoreResult<()> {
        reject_local_id("update-session-title", session_id.as_str())?;

        sqlx::query("UPDATE sessions SET title = ?, updated_at = ? WHERE id = ?")
            .bind(title)
            .bind(encode_timestamp(Utc::now()))
            .bind(session_id.as_str())
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "update-session-title",
            })?;

        let owner = self.query_session_owner(session_id).await?;
        let sessions = self.query_sessions(&owner).await?;
        self.session_watchers.push(owner.as_str(), sessions);
        Ok(())
    }

    async fn update_session_message_count(
        &self,
        session_id: &SessionId,
        count: u32,
    ) -> StoreResult<()> {
        reject_local_id("update-session-message-count", session_id.as_str())?;

        sqlx::query("UPDATE sessions SET message_count = ? WHERE id = ?")
            .bind(count as i64)
            .bind(session_id.as_str())
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "update-session-message-count",
            })?;

        let owner = self.query_session_owner(session_id).await?;
        let sessions = self.query_sessions(&owner).await?;
        self.session_watchers.push(owner.as_str(), sessions);
        Ok(())
    }

    async fn delete_session(&self, session_id: &SessionId) -> StoreResult<()> {
        reject_local_id("delete-session", session_id.as_str())?;
        let owner = self.query_session_owner(session_id).await?;

        // Messages go first so no session record ever outlives its history
        // partially deleted; the FK cascade is only a backstop.
        sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(session_id.as_str())
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "delete-session-messages",
            })?;

        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(session_id.as_str())
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "delete-session-record",
            })?;

        self.push_session_change(session_id, &owner).await
    }
}

fn reject_local_id(stage: &'static str, raw: &str) -> StoreResult<()> {
    if raw.starts_with(super::ids::LOCAL_ID_PREFIX) {
        return Err(StoreError::LocalOnlyId {
            stage,
            id: raw.to_string(),
        });
    }
    Ok(())
}

fn encode_timestamp(timestamp: DateTime<Utc>) -> String {
    // Fixed-width UTC text keeps lexicographic and chronological order equal.
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_timestamp(stage: &'static str, raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|source| StoreError::MalformedRow {
            stage,
            details: format!("timestamp '{raw}': {source}"),
        })
}

fn session_from_row(row: &SqliteRow) -> StoreResult<SessionRecord> {
    Ok(SessionRecord {
        id: SessionId::new(row.get::<String, _>("id")),
        user_id: UserId::new(row.get::<String, _>("user_id")),
        title: row.get("title"),
        created_at: decode_timestamp("session-created-at", &row.get::<String, _>("created_at"))?,
        updated_at: decode_timestamp("session-updated-at", &row.get::<String, _>("updated_at"))?,
        message_count: row.get::<i64, _>("message_count") as u32,
    })
}

fn message_from_row(row: &SqliteRow) -> StoreResult<MessageRecord> {
    let role_raw: String = row.get("role");
    let role = MessageRole::parse(&role_raw).ok_or_else(|| StoreError::MalformedRow {
        stage: "message-role",
        details: format!("unknown role '{role_raw}'"),
    })?;

    Ok(MessageRecord {
        seq: row.get::<i64, _>("seq") as u64,
        id: MessageId::new(row.get::<String, _>("id")),
        session_id: SessionId::new(row.get::<String, _>("session_id")),
        role,
        content: row.get("content"),
        timestamp: decode_timestamp("message-timestamp", &row.get::<String, _>("timestamp"))?,
        is_streaming: row.get("is_streaming"),
        error: row.get("error"),
    })
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        database_location.to_string()
    } else {
        format!("sqlite://{database_location}")
    }
}

fn ensure_database_directory(database_location: &str) -> StoreResult<()> {
    if database_location.starts_with("sqlite:") {
        return Ok(());
    }

    if let Some(parent) = Path::new(database_location).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "ensure-database-directory",
            path: parent.display().to_string(),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::super::SubscriptionEvent;
    use super::*;

    fn owner() -> UserId {
        UserId::new("user-1")
    }

    fn new_message(content: &str, timestamp: DateTime<Utc>) -> NewMessageRecord {
        NewMessageRecord {
            role: MessageRole::User,
            content: content.to_string(),
            timestamp,
            is_streaming: false,
            error: None,
        }
    }

    fn at(seconds: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, seconds).unwrap()
    }

    #[tokio::test]
    async fn add_message_assigns_id_and_bumps_session() {
        let gateway = SqliteGateway::open_in_memory().await.unwrap();
        let session = gateway.create_session(&owner(), "hello").await.unwrap();

        let stored = gateway
            .add_message(&session.id, new_message("hi", at(0)))
            .await
            .unwrap();
        assert!(!stored.id.is_local());

        let sessions = gateway.list_sessions(&owner()).await.unwrap();
        assert_eq!(sessions[0].message_count, 1);
        assert!(sessions[0].updated_at >= session.updated_at);
    }

    #[tokio::test]
    async fn messages_order_by_timestamp_then_insertion() {
        let gateway = SqliteGateway::open_in_memory().await.unwrap();
        let session = gateway.create_session(&owner(), "order").await.unwrap();

        // Insert out of chronological order, with a timestamp tie.
        gateway
            .add_message(&session.id, new_message("third", at(5)))
            .await
            .unwrap();
        gateway
            .add_message(&session.id, new_message("first", at(1)))
            .await
            .unwrap();
        gateway
            .add_message(&session.id, new_message("second", at(1)))
            .await
            .unwrap();

        let mut subscription = gateway.subscribe_messages(&session.id).await.unwrap();
        let Some(SubscriptionEvent::Snapshot(snapshot)) = subscription.try_recv() else {
            panic!("expected initial snapshot");
        };

        let contents: Vec<&str> = snapshot
            .iter()
            .map(|message| message.content.as_str())
            .collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn session_list_is_recent_first_and_capped() {
        let gateway = SqliteGateway::open_in_memory().await.unwrap();

        for index in 0..55 {
            gateway
                .create_session(&owner(), &format!("session-{index}"))
                .await
                .unwrap();
        }

        let sessions = gateway.list_sessions(&owner()).await.unwrap();
        assert_eq!(sessions.len(), SESSION_LIST_LIMIT);
        for pair in sessions.windows(2) {
            assert!(pair[0].updated_at >= pair[1].updated_at);
        }
    }

    #[tokio::test]
    async fn update_message_patches_fields_in_place() {
        let gateway = SqliteGateway::open_in_memory().await.unwrap();
        let session = gateway.create_session(&owner(), "patch").await.unwrap();
        let stored = gateway
            .add_message(
                &session.id,
                NewMessageRecord {
                    role: MessageRole::Assistant,
                    content: String::new(),
                    timestamp: at(1),
                    is_streaming: true,
                    error: None,
                },
            )
            .await
            .unwrap();

        gateway
            .update_message(
                &session.id,
                &stored.id,
                MessageRecordPatch {
                    content: Some("done".to_string()),
                    is_streaming: Some(false),
                    ..MessageRecordPatch::default()
                },
            )
            .await
            .unwrap();

        let mut subscription = gateway.subscribe_messages(&session.id).await.unwrap();
        let Some(SubscriptionEvent::Snapshot(snapshot)) = subscription.try_recv() else {
            panic!("expected initial snapshot");
        };
        assert_eq!(snapshot[0].content, "done");
        assert!(!snapshot[0].is_streaming);
    }

    #[tokio::test]
    async fn message_count_override_is_stored_and_pushed() {
        let gateway = SqliteGateway::open_in_memory().await.unwrap();
        let session = gateway.create_session(&owner(), "count").await.unwrap();
        gateway
            .add_message(&session.id, new_message("one", at(0)))
            .await
            .unwrap();

        let mut subscription = gateway.subscribe_sessions(&owner()).await.unwrap();
        let _ = subscription.try_recv();

        gateway
            .update_session_message_count(&session.id, 4)
            .await
            .unwrap();

        let sessions = gateway.list_sessions(&owner()).await.unwrap();
        assert_eq!(sessions[0].message_count, 4);

        let Some(SubscriptionEvent::Snapshot(snapshot)) = subscription.try_recv() else {
            panic!("expected change push");
        };
        assert_eq!(snapshot[0].message_count, 4);
    }

    #[tokio::test]
    async fn delete_session_cascades_to_messages() {
        let gateway = SqliteGateway::open_in_memory().await.unwrap();
        let session = gateway.create_session(&owner(), "doomed").await.unwrap();
        for index in 0..3 {
            gateway
                .add_message(&session.id, new_message(&format!("m{index}"), at(index)))
                .await
                .unwrap();
        }

        gateway.delete_session(&session.id).await.unwrap();

        let remaining =
            sqlx::query("SELECT COUNT(*) AS n FROM messages WHERE session_id = ?")
                .bind(session.id.as_str())
                .fetch_one(gateway.pool())
                .await
                .unwrap();
        assert_eq!(remaining.get::<i64, _>("n"), 0);
        assert!(gateway.list_sessions(&owner()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn subscriptions_receive_change_pushes() {
        let gateway = SqliteGateway::open_in_memory().await.unwrap();
        let session = gateway.create_session(&owner(), "watch").await.unwrap();

        let mut subscription = gateway.subscribe_messages(&session.id).await.unwrap();
        assert!(matches!(
            subscription.try_recv(),
            Some(SubscriptionEvent::Snapshot(snapshot)) if snapshot.is_empty()
        ));

        gateway
            .add_message(&session.id, new_message("pushed", at(0)))
            .await
            .unwrap();

        let Some(SubscriptionEvent::Snapshot(snapshot)) = subscription.try_recv() else {
            panic!("expected change push");
        };
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].content, "pushed");
    }

    #[tokio::test]
    async fn local_only_ids_are_rejected() {
        let gateway = SqliteGateway::open_in_memory().await.unwrap();
        let local = SessionId::generate_local();

        let result = gateway.add_message(&local, new_message("nope", at(0))).await;
        assert!(matches!(result, Err(StoreError::LocalOnlyId { .. })));
    }
}
