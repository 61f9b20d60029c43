#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use futures::stream;
use murmur::chat::{SessionSummary, ViewRenderer};
use murmur_llm::{
    BoxFuture, CompletionClient, LineStream, ProviderError, ProviderMessage, ProviderResult,
};
use murmur_storage::{
    ChatStore, Listener, MemoryStore, MessageRecord, MessageRole, MessagesSnapshot, NewMessage,
    NewSession, SessionId, SessionRecord, SessionsSnapshot, StorageError, StorageResult,
    Subscription,
};
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewEvent {
    Messages(Vec<(MessageRole, String)>),
    Empty,
    SessionList(Vec<SessionSummary>),
    Clear,
    ShowThinking,
    HideThinking,
    StreamText(String),
    Fallback(String),
}

/// Records every call the chat core makes into the view.
#[derive(Debug, Default)]
pub struct RecordingRenderer {
    events: Mutex<Vec<ViewEvent>>,
}

impl RecordingRenderer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, event: ViewEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<ViewEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn stream_updates(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ViewEvent::StreamText(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn fallbacks(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ViewEvent::Fallback(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Text of the in-progress assistant bubble after the last turn.
    pub fn bubble(&self) -> Option<String> {
        self.events().into_iter().rev().find_map(|event| match event {
            ViewEvent::StreamText(text) | ViewEvent::Fallback(text) => Some(text),
            _ => None,
        })
    }

    pub fn thinking_visible(&self) -> bool {
        self.events().into_iter().fold(false, |visible, event| match event {
            ViewEvent::ShowThinking => true,
            ViewEvent::HideThinking => false,
            _ => visible,
        })
    }

    pub fn count(&self, wanted: &ViewEvent) -> usize {
        self.events().iter().filter(|event| *event == wanted).count()
    }

    pub fn last_session_list(&self) -> Option<Vec<SessionSummary>> {
        self.events().into_iter().rev().find_map(|event| match event {
            ViewEvent::SessionList(sessions) => Some(sessions),
            _ => None,
        })
    }

    pub fn message_renders(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, ViewEvent::Messages(_) | ViewEvent::Empty))
            .count()
    }
}

impl ViewRenderer for RecordingRenderer {
    fn render_messages(&self, messages: &[MessageRecord]) {
        let flattened = messages
            .iter()
            .map(|message| (message.role, message.content.text()))
            .collect();
        self.push(ViewEvent::Messages(flattened));
    }

    fn render_empty_state(&self) {
        self.push(ViewEvent::Empty);
    }

    fn render_session_list(&self, sessions: &[SessionSummary]) {
        self.push(ViewEvent::SessionList(sessions.to_vec()));
    }

    fn clear(&self) {
        self.push(ViewEvent::Clear);
    }

    fn show_thinking(&self) {
        self.push(ViewEvent::ShowThinking);
    }

    fn hide_thinking(&self) {
        self.push(ViewEvent::HideThinking);
    }

    fn render_stream_text(&self, text: &str) {
        self.push(ViewEvent::StreamText(text.to_string()));
    }

    fn render_fallback(&self, text: &str) {
        self.push(ViewEvent::Fallback(text.to_string()));
    }
}

pub fn chunk_line(content: &str) -> String {
    let chunk = serde_json::json!({"choices": [{"delta": {"content": content}}]});
    format!("data: {chunk}")
}

pub fn done_line() -> String {
    "data: [DONE]".to_string()
}

/// Lines for a well-formed reply made of `pieces`, terminated by the done marker.
pub fn reply_lines(pieces: &[&str]) -> Vec<String> {
    let mut lines = pieces.iter().map(|piece| chunk_line(piece)).collect::<Vec<_>>();
    lines.push(done_line());
    lines
}

pub enum Reply {
    Lines(Vec<String>),
    /// The request is rejected before any line arrives.
    Refuse,
    /// The given lines arrive, then the connection breaks.
    BreakAfter(Vec<String>),
}

fn transport_error() -> ProviderError {
    ProviderError::HttpStatus {
        stage: "scripted-client",
        status: 502,
        body: "bad gateway".to_string(),
    }
}

/// Completion client that plays back scripted replies and records requests.
#[derive(Default)]
pub struct ScriptedCompletionClient {
    replies: Mutex<VecDeque<Reply>>,
    vision_replies: Mutex<VecDeque<Option<String>>>,
    requests: Mutex<Vec<Vec<ProviderMessage>>>,
    vision_requests: Mutex<Vec<(String, String)>>,
    gate: Option<Arc<Notify>>,
}

impl ScriptedCompletionClient {
    pub fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        })
    }

    /// Every stream waits for `gate` before it opens.
    pub fn gated(replies: Vec<Reply>, gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            gate: Some(gate),
            ..Self::default()
        })
    }

    /// `None` entries fail the vision call.
    pub fn with_vision(replies: Vec<Option<&str>>) -> Arc<Self> {
        Arc::new(Self {
            vision_replies: Mutex::new(
                replies
                    .into_iter()
                    .map(|reply| reply.map(str::to_string))
                    .collect(),
            ),
            ..Self::default()
        })
    }

    pub fn requests(&self) -> Vec<Vec<ProviderMessage>> {
        self.requests.lock().unwrap().clone()
    }

    pub fn vision_requests(&self) -> Vec<(String, String)> {
        self.vision_requests.lock().unwrap().clone()
    }
}

impl CompletionClient for ScriptedCompletionClient {
    fn stream_completion(
        &self,
        messages: Vec<ProviderMessage>,
    ) -> BoxFuture<'_, ProviderResult<LineStream>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(messages);
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Reply::Lines(vec![done_line()]));

            if let Some(gate) = &self.gate {
                gate.notified().await;
            }

            let lines: Vec<ProviderResult<String>> = match reply {
                Reply::Lines(lines) => lines.into_iter().map(Ok).collect(),
                Reply::Refuse => return Err(transport_error()),
                Reply::BreakAfter(lines) => lines
                    .into_iter()
                    .map(Ok)
                    .chain(std::iter::once(Err(ProviderError::StreamIdle {
                        stage: "scripted-client",
                        idle_secs: 1,
                    })))
                    .collect(),
            };
            let stream: LineStream = stream::iter(lines).boxed();
            Ok(stream)
        })
    }

    fn describe_image(
        &self,
        image_url: String,
        prompt: String,
    ) -> BoxFuture<'_, ProviderResult<String>> {
        Box::pin(async move {
            self.vision_requests.lock().unwrap().push((image_url, prompt));
            let reply = self.vision_replies.lock().unwrap().pop_front().flatten();
            reply.ok_or_else(transport_error)
        })
    }
}

/// Memory store whose writes can be made to fail on demand.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_creates: AtomicBool,
    fail_subscribes: AtomicBool,
    fail_appends_for: Mutex<Option<MessageRole>>,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_subscribes(&self, fail: bool) {
        self.fail_subscribes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_appends_for(&self, role: Option<MessageRole>) {
        *self.fail_appends_for.lock().unwrap() = role;
    }
}

fn unavailable(stage: &'static str) -> StorageError {
    StorageError::InvariantViolation {
        stage,
        details: "store offline".to_string(),
    }
}

impl ChatStore for FlakyStore {
    fn create_session(&self, input: NewSession) -> BoxFuture<'_, StorageResult<SessionRecord>> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Box::pin(async { Err(unavailable("flaky-create")) });
        }
        self.inner.create_session(input)
    }

    fn append_message(
        &self,
        session_id: SessionId,
        input: NewMessage,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        if *self.fail_appends_for.lock().unwrap() == Some(input.role) {
            return Box::pin(async { Err(unavailable("flaky-append")) });
        }
        self.inner.append_message(session_id, input)
    }

    fn load_messages(
        &self,
        session_id: SessionId,
    ) -> BoxFuture<'_, StorageResult<MessagesSnapshot>> {
        self.inner.load_messages(session_id)
    }

    fn subscribe_messages(
        &self,
        session_id: SessionId,
        listener: Listener<MessagesSnapshot>,
    ) -> BoxFuture<'_, StorageResult<Subscription>> {
        if self.fail_subscribes.load(Ordering::SeqCst) {
            return Box::pin(async { Err(unavailable("flaky-subscribe")) });
        }
        self.inner.subscribe_messages(session_id, listener)
    }

    fn subscribe_sessions(
        &self,
        user_id: String,
        listener: Listener<SessionsSnapshot>,
    ) -> BoxFuture<'_, StorageResult<Subscription>> {
        self.inner.subscribe_sessions(user_id, listener)
    }

    fn delete_session(&self, session_id: SessionId) -> BoxFuture<'_, StorageResult<()>> {
        self.inner.delete_session(session_id)
    }
}
