#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use murmur_storage::{
    ChatStore, Listener, MessageRole, NewMessage, NewSession, StorageError,
};

pub struct Recorder<T> {
    seen: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone + Send + 'static> Recorder<T> {
    pub fn new() -> Self {
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn listener(&self) -> Listener<T> {
        let sink = Arc::clone(&self.seen);
        Arc::new(move |snapshot| sink.lock().unwrap().push(snapshot))
    }

    pub fn snapshots(&self) -> Vec<T> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

pub async fn sessions_list_newest_first_including_temporary(store: &dyn ChatStore) {
    let first = store.create_session(NewSession::new("ada", false)).await.unwrap();
    let second = store.create_session(NewSession::new("ada", true)).await.unwrap();
    let third = store.create_session(NewSession::new("ada", false)).await.unwrap();
    store.create_session(NewSession::new("grace", false)).await.unwrap();

    let recorder = Recorder::new();
    let _subscription = store
        .subscribe_sessions("ada".to_string(), recorder.listener())
        .await
        .unwrap();

    let snapshots = recorder.snapshots();
    assert_eq!(snapshots.len(), 1, "registration delivers the current snapshot");
    let ids = snapshots[0].iter().map(|session| session.id).collect::<Vec<_>>();
    assert_eq!(ids, vec![third.id, second.id, first.id]);
    assert!(snapshots[0][1].is_temporary);
}

pub async fn message_subscription_tracks_appends(store: &dyn ChatStore) {
    let session = store.create_session(NewSession::new("ada", false)).await.unwrap();
    let recorder = Recorder::new();
    let _subscription = store
        .subscribe_messages(session.id, recorder.listener())
        .await
        .unwrap();

    store
        .append_message(session.id, NewMessage::user("hello"))
        .await
        .unwrap();
    let reply = store
        .append_message(session.id, NewMessage::assistant("hi there"))
        .await
        .unwrap();
    assert_eq!(reply.seq, 2);

    let snapshots = recorder.snapshots();
    assert_eq!(snapshots.len(), 3);
    assert!(snapshots[0].is_empty());
    assert_eq!(snapshots[1].len(), 1);
    let roles = snapshots[2].iter().map(|message| message.role).collect::<Vec<_>>();
    assert_eq!(roles, vec![MessageRole::User, MessageRole::Assistant]);
    assert_eq!(snapshots[2][1].content.text(), "hi there");

    let loaded = store.load_messages(session.id).await.unwrap();
    assert_eq!(loaded, snapshots[2]);
}

pub async fn unsubscribed_listener_receives_nothing(store: &dyn ChatStore) {
    let session = store.create_session(NewSession::new("ada", false)).await.unwrap();
    let recorder = Recorder::new();
    let subscription = store
        .subscribe_messages(session.id, recorder.listener())
        .await
        .unwrap();
    subscription.unsubscribe();

    store
        .append_message(session.id, NewMessage::user("after"))
        .await
        .unwrap();

    assert_eq!(recorder.count(), 1);
}

pub async fn delete_removes_session_from_snapshots(store: &dyn ChatStore) {
    let keep = store.create_session(NewSession::new("ada", false)).await.unwrap();
    let doomed = store.create_session(NewSession::new("ada", false)).await.unwrap();
    store
        .append_message(doomed.id, NewMessage::user("bye"))
        .await
        .unwrap();

    let sessions = Recorder::new();
    let messages = Recorder::new();
    let _sessions_subscription = store
        .subscribe_sessions("ada".to_string(), sessions.listener())
        .await
        .unwrap();
    let _messages_subscription = store
        .subscribe_messages(doomed.id, messages.listener())
        .await
        .unwrap();

    store.delete_session(doomed.id).await.unwrap();

    let latest_sessions = sessions.snapshots().pop().unwrap();
    assert_eq!(
        latest_sessions.iter().map(|s| s.id).collect::<Vec<_>>(),
        vec![keep.id]
    );
    assert!(messages.snapshots().pop().unwrap().is_empty());
    assert!(store.load_messages(doomed.id).await.unwrap().is_empty());

    // Deleting again is a no-op rather than an error.
    store.delete_session(doomed.id).await.unwrap();
}

pub async fn append_to_unknown_session_fails(store: &dyn ChatStore) {
    let session = store.create_session(NewSession::new("ada", false)).await.unwrap();
    store.delete_session(session.id).await.unwrap();

    let error = store
        .append_message(session.id, NewMessage::user("lost"))
        .await
        .unwrap_err();
    assert!(matches!(error, StorageError::NotFound { entity: "session", .. }));
}
