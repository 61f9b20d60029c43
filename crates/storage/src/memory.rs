use chrono::Utc;
use tokio::sync::RwLock;

use super::error::{NotFoundSnafu, StorageResult};
use super::ids::SessionId;
use super::subscription::{Listener, Subscription, Topic};
use super::types::{MessageRecord, NewMessage, NewSession, SessionRecord};
use super::{BoxFuture, ChatStore, MessagesSnapshot, SessionsSnapshot};

/// In-process chat store with live snapshot subscriptions.
///
/// Nothing survives the process; used by tests and as a scratch store when no
/// database is configured.
#[derive(Default)]
pub struct MemoryStore {
    // Insertion order; list snapshots re-sort by creation time.
    sessions: RwLock<Vec<SessionRecord>>,
    message_topic: Topic<SessionId, MessagesSnapshot>,
    session_topic: Topic<String, SessionsSnapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn messages_snapshot(&self, session_id: SessionId) -> MessagesSnapshot {
        self.sessions
            .read()
            .await
            .iter()
            .find(|session| session.id == session_id)
            .map(|session| session.messages.clone())
            .unwrap_or_default()
    }

    async fn sessions_snapshot(&self, user_id: &str) -> SessionsSnapshot {
        let mut owned = self
            .sessions
            .read()
            .await
            .iter()
            .rev()
            .filter(|session| session.user_id == user_id)
            .cloned()
            .collect::<Vec<_>>();
        // Stable sort keeps later inserts first when creation times collide.
        owned.sort_by(|left, right| right.created_at.cmp(&left.created_at));
        owned
    }

    async fn publish_messages(&self, session_id: SessionId) {
        if self.message_topic.has_listeners(&session_id) {
            let snapshot = self.messages_snapshot(session_id).await;
            self.message_topic.notify(&session_id, snapshot);
        }
    }

    async fn publish_sessions(&self, user_id: &str) {
        let key = user_id.to_string();
        if self.session_topic.has_listeners(&key) {
            let snapshot = self.sessions_snapshot(user_id).await;
            self.session_topic.notify(&key, snapshot);
        }
    }
}

impl ChatStore for MemoryStore {
    fn create_session(&self, input: NewSession) -> BoxFuture<'_, StorageResult<SessionRecord>> {
        Box::pin(async move {
            let record = SessionRecord {
                id: SessionId::new_v7(),
                user_id: input.user_id,
                created_at: Utc::now(),
                is_temporary: input.is_temporary,
                messages: Vec::new(),
            };
            self.sessions.write().await.push(record.clone());

            tracing::debug!(
                session_id = %record.id,
                user_id = %record.user_id,
                is_temporary = record.is_temporary,
                "created in-memory session"
            );
            self.publish_sessions(&record.user_id).await;
            Ok(record)
        })
    }

    fn append_message(
        &self,
        session_id: SessionId,
        input: NewMessage,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let (record, user_id) = {
                let mut sessions = self.sessions.write().await;
                let Some(session) = sessions.iter_mut().find(|session| session.id == session_id)
                else {
                    return NotFoundSnafu {
                        stage: "memory-append-message",
                        entity: "session",
                        id: session_id.to_string(),
                    }
                    .fail();
                };
                let record = input.into_record(session.messages.len() as u64 + 1);
                session.messages.push(record.clone());
                (record, session.user_id.clone())
            };

            self.publish_messages(session_id).await;
            self.publish_sessions(&user_id).await;
            Ok(record)
        })
    }

    fn load_messages(
        &self,
        session_id: SessionId,
    ) -> BoxFuture<'_, StorageResult<MessagesSnapshot>> {
        Box::pin(async move { Ok(self.messages_snapshot(session_id).await) })
    }

    fn subscribe_messages(
        &self,
        session_id: SessionId,
        listener: Listener<MessagesSnapshot>,
    ) -> BoxFuture<'_, StorageResult<Subscription>> {
        Box::pin(async move {
            let (subscription, registration) = self.message_topic.register(session_id, listener);
            registration.deliver(self.messages_snapshot(session_id).await);
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
            registration.deliver(self.sessions_snapshot(&snapshot_key).await);
            Ok(subscription)
        })
    }

    fn delete_session(&self, session_id: SessionId) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let removed = {
                let mut sessions = self.sessions.write().await;
                let position = sessions.iter().position(|session| session.id == session_id);
                position.map(|index| sessions.remove(index))
            };

            match removed {
                Some(session) => {
                    tracing::debug!(session_id = %session_id, "deleted in-memory session");
                    self.publish_messages(session_id).await;
                    self.publish_sessions(&session.user_id).await;
                }
                None => {
                    tracing::debug!(session_id = %session_id, "delete ignored for unknown session");
                }
            }
            Ok(())
        })
    }
}
