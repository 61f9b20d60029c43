use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod subscription;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::SessionId;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use subscription::{Listener, Subscription, SubscriptionSlot};
pub use types::{
    ContentPart, ImageRef, MessageContent, MessageRecord, MessageRole, NewMessage, NewSession,
    SessionRecord,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Snapshot of one session's messages in insertion order.
pub type MessagesSnapshot = Vec<MessageRecord>;

/// Snapshot of every session a user owns, newest first by creation time.
pub type SessionsSnapshot = Vec<SessionRecord>;

/// Chat document store.
///
/// Sessions are append-only: messages are added, never edited or removed, and a
/// session disappears only through `delete_session`. Subscriptions deliver the
/// full current snapshot on registration and again after every change.
pub trait ChatStore: Send + Sync {
    fn create_session(&self, input: NewSession) -> BoxFuture<'_, StorageResult<SessionRecord>>;

    fn append_message(
        &self,
        session_id: SessionId,
        input: NewMessage,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>>;

    /// One-shot read; an unknown session reads as empty.
    fn load_messages(&self, session_id: SessionId)
    -> BoxFuture<'_, StorageResult<MessagesSnapshot>>;

    fn subscribe_messages(
        &self,
        session_id: SessionId,
        listener: Listener<MessagesSnapshot>,
    ) -> BoxFuture<'_, StorageResult<Subscription>>;

    fn subscribe_sessions(
        &self,
        user_id: String,
        listener: Listener<SessionsSnapshot>,
    ) -> BoxFuture<'_, StorageResult<Subscription>>;

    fn delete_session(&self, session_id: SessionId) -> BoxFuture<'_, StorageResult<()>>;
}
