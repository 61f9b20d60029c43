use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use super::error::{
    CreateSqliteDirectorySnafu, DecodeContentSnafu, DecodeTimestampSnafu, EncodeContentSnafu,
    InvariantViolationSnafu, NotFoundSnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu,
    SqliteMigrateSnafu, SqlitePragmaSnafu, SqliteQuerySnafu, StorageError, StorageResult,
};
use super::ids::SessionId;
use super::subscription::{Listener, Subscription, Topic};
use super::types::{MessageContent, MessageRecord, MessageRole, NewMessage, NewSession, SessionRecord};
use super::{BoxFuture, ChatStore, MessagesSnapshot, SessionsSnapshot};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Durable chat store backed by SQLite.
///
/// Subscriptions are process-local: listeners are notified after writes made
/// through this handle, with snapshots re-read from the database.
pub struct SqliteStore {
    pool: SqlitePool,
    message_topic: Topic<SessionId, MessagesSnapshot>,
    session_topic: Topic<String, SessionsSnapshot>,
}

impl SqliteStore {
    /// Opens `location`, which may be a file path, `:memory:` or a full `sqlite:` URL.
    pub async fn open(location: &str) -> StorageResult<Self> {
        let url = prepare_location(location)?;
        let options = url
            .parse::<SqliteConnectOptions>()
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        // One long-lived connection: an in-memory database lives exactly as long as it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: url.clone(),
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

        tracing::info!(database_url = %url, "opened sqlite chat store");

        Ok(Self {
            pool,
            message_topic: Topic::default(),
            session_topic: Topic::default(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn messages_snapshot(&self, session_id: SessionId) -> StorageResult<MessagesSnapshot> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT session_id, seq, role, content, timestamp FROM messages WHERE session_id = ? ORDER BY seq ASC",
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "messages-snapshot-query",
        })?;

        rows.into_iter().map(message_row_to_record).collect()
    }

    async fn sessions_snapshot(&self, user_id: &str) -> StorageResult<SessionsSnapshot> {
        let session_rows = sqlx::query_as::<_, SessionRow>(
            "SELECT id, user_id, created_at, is_temporary FROM sessions WHERE user_id = ? ORDER BY created_at DESC, rowid DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "sessions-snapshot-query",
        })?;

        let message_rows = sqlx::query_as::<_, MessageRow>(
            "SELECT m.session_id, m.seq, m.role, m.content, m.timestamp FROM messages m JOIN sessions s ON s.id = m.session_id WHERE s.user_id = ? ORDER BY m.session_id, m.seq ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "sessions-snapshot-messages-query",
        })?;

        let mut messages_by_session: HashMap<String, Vec<MessageRecord>> = HashMap::new();
        for row in message_rows {
            let session_key = row.session_id.clone();
            messages_by_session
                .entry(session_key)
                .or_default()
                .push(message_row_to_record(row)?);
        }

        session_rows
            .into_iter()
            .map(|row| {
                let messages = messages_by_session.remove(&row.id).unwrap_or_default();
                session_row_to_record(row, messages)
            })
            .collect()
    }

    async fn publish_messages(&self, session_id: SessionId) {
        if !self.message_topic.has_listeners(&session_id) {
            return;
        }

        match self.messages_snapshot(session_id).await {
            Ok(snapshot) => self.message_topic.notify(&session_id, snapshot),
            Err(error) => tracing::warn!(
                session_id = %session_id,
                error = %error,
                "skipping message snapshot delivery"
            ),
        }
    }

    async fn publish_sessions(&self, user_id: &str) {
        let key = user_id.to_string();
        if !self.session_topic.has_listeners(&key) {
            return;
        }

        match self.sessions_snapshot(user_id).await {
            Ok(snapshot) => self.session_topic.notify(&key, snapshot),
            Err(error) => tracing::warn!(
                user_id = %user_id,
                error = %error,
                "skipping session list snapshot delivery"
            ),
        }
    }

    async fn session_owner(&self, session_id: SessionId) -> StorageResult<Option<String>> {
        sqlx::query_scalar::<_, String>("SELECT user_id FROM sessions WHERE id = ?")
            .bind(session_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "session-owner-query",
            })
    }
}

impl ChatStore for SqliteStore {
    fn create_session(&self, input: NewSession) -> BoxFuture<'_, StorageResult<SessionRecord>> {
        Box::pin(async move {
            let session_id = SessionId::new_v7();
            let created_at = Utc::now();
            let created_at_text = timestamp_to_sql(created_at);

            sqlx::query(
                "INSERT INTO sessions (id, user_id, created_at, is_temporary, updated_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(session_id.to_string())
            .bind(&input.user_id)
            .bind(&created_at_text)
            .bind(input.is_temporary)
            .bind(&created_at_text)
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "session-create-insert",
            })?;

            tracing::debug!(
                session_id = %session_id,
                user_id = %input.user_id,
                is_temporary = input.is_temporary,
                "created sqlite session"
            );

            self.publish_sessions(&input.user_id).await;

            Ok(SessionRecord {
                id: session_id,
                user_id: input.user_id,
                created_at,
                is_temporary: input.is_temporary,
                messages: Vec::new(),
            })
        })
    }

    fn append_message(
        &self,
        session_id: SessionId,
        input: NewMessage,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let content_json = serde_json::to_string(&input.content).context(EncodeContentSnafu {
                stage: "message-append-encode-content",
            })?;

            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "message-append-begin",
            })?;

            let Some(user_id) =
                sqlx::query_scalar::<_, String>("SELECT user_id FROM sessions WHERE id = ?")
                    .bind(session_id.to_string())
                    .fetch_optional(&mut *tx)
                    .await
                    .context(SqliteQuerySnafu {
                        stage: "message-append-load-session",
                    })?
            else {
                return NotFoundSnafu {
                    stage: "message-append-missing-session",
                    entity: "session",
                    id: session_id.to_string(),
                }
                .fail();
            };

            let next_seq = sqlx::query_scalar::<_, i64>(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE session_id = ?",
            )
            .bind(session_id.to_string())
            .fetch_one(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-next-seq",
            })?;

            let timestamp_text = timestamp_to_sql(input.timestamp);
            sqlx::query(
                "INSERT INTO messages (session_id, seq, role, content, timestamp) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(session_id.to_string())
            .bind(next_seq)
            .bind(input.role.as_str())
            .bind(content_json)
            .bind(&timestamp_text)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-insert",
            })?;

            sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = ?")
                .bind(timestamp_to_sql(Utc::now()))
                .bind(session_id.to_string())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-append-touch-session",
                })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-append-commit",
            })?;

            let record = input.into_record(i64_to_u64(next_seq, "message-append-seq")?);

            self.publish_messages(session_id).await;
            self.publish_sessions(&user_id).await;
            Ok(record)
        })
    }

    fn load_messages(
        &self,
        session_id: SessionId,
    ) -> BoxFuture<'_, StorageResult<MessagesSnapshot>> {
        Box::pin(self.messages_snapshot(session_id))
    }

    fn subscribe_messages(
        &self,
        session_id: SessionId,
        listener: Listener<MessagesSnapshot>,
    ) -> BoxFuture<'_, StorageResult<Subscription>> {
        Box::pin(async move {
            let (subscription, registration) = self.message_topic.register(session_id, listener);
            registration.deliver(self.messages_snapshot(session_id).await?);
            Ok(subscription)
        })
    }

    fn subscribe_sessions(
        &self,
        user_id: String,
        listener: Listener<SessionsSnapshot>,
    ) -> BoxFuture<'_, StorageResult<Subscription>> {
        Box::pin(async move {
            let snapshot_key = user_id.clone();
            let (subscription, registration) = self.session_topic.register(user_id, listener);
            registration.deliver(self.sessions_snapshot(&snapshot_key).await?);
            Ok(subscription)
        })
    }

    fn delete_session(&self, session_id: SessionId) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let Some(user_id) = self.session_owner(session_id).await? else {
                tracing::debug!(session_id = %session_id, "delete ignored for unknown session");
                return Ok(());
            };

            sqlx::query("DELETE FROM sessions WHERE id = ?")
                .bind(session_id.to_string())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "session-delete-apply",
                })?;

            tracing::debug!(session_id = %session_id, "deleted sqlite session");

            self.publish_messages(session_id).await;
            self.publish_sessions(&user_id).await;
            Ok(())
        })
    }
}

#[derive(Debug, FromRow)]
struct SessionRow {
    id: String,
    user_id: String,
    created_at: String,
    is_temporary: bool,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    session_id: String,
    seq: i64,
    role: String,
    content: String,
    timestamp: String,
}

fn session_row_to_record(
    row: SessionRow,
    messages: Vec<MessageRecord>,
) -> StorageResult<SessionRecord> {
    Ok(SessionRecord {
        id: SessionId::parse(&row.id)?,
        user_id: row.user_id,
        created_at: timestamp_from_sql(&row.created_at, "session-row-created-at")?,
        is_temporary: row.is_temporary,
        messages,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    let content: MessageContent =
        serde_json::from_str(&row.content).context(DecodeContentSnafu {
            stage: "message-row-content",
        })?;

    Ok(MessageRecord {
        seq: i64_to_u64(row.seq, "message-row-seq")?,
        role: role_from_sql(&row.role)?,
        content,
        timestamp: timestamp_from_sql(&row.timestamp, "message-row-timestamp")?,
    })
}

fn role_from_sql(raw: &str) -> StorageResult<MessageRole> {
    match raw {
        "system" => Ok(MessageRole::System),
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        _ => InvariantViolationSnafu {
            stage: "message-role-from-sql",
            details: format!("unknown message role '{raw}'"),
        }
        .fail(),
    }
}

// Fixed-width nanosecond text keeps lexical order equal to chronological order.
fn timestamp_to_sql(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn timestamp_from_sql(raw: &str, stage: &'static str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|parsed| parsed.with_timezone(&Utc))
        .context(DecodeTimestampSnafu {
            stage,
            raw: raw.to_string(),
        })
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

/// Turns a store location into a connection URL, creating the parent
/// directory of plain file paths.
fn prepare_location(location: &str) -> StorageResult<String> {
    if location.starts_with("sqlite:") {
        return Ok(location.to_string());
    }
    if location == ":memory:" {
        return Ok("sqlite::memory:".to_string());
    }

    match Path::new(location).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
                stage: "sqlite-open-create-directory",
                path: parent.display().to_string(),
            })?;
        }
        _ => {}
    }
    Ok(format!("sqlite://{location}"))
}
