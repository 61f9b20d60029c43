use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwap;
use murmur_llm::CompletionClient;
use murmur_storage::{
    ChatStore, Listener, MessagesSnapshot, NewMessage, NewSession, SessionId, SessionsSnapshot,
    SubscriptionSlot,
};
use snafu::ResultExt;

use super::assembler::{MessageStreamAssembler, StreamTicket};
use super::context::SessionContext;
use super::error::{ChatError, ChatResult, CompletionFailedSnafu, StoreUnavailableSnafu};
use super::image::ImageAttachment;
use super::render::{SessionSummary, ThinkingIndicator, ViewRenderer};

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant. Respond in a clear and concise manner.";
pub const DEFAULT_VISION_PROMPT: &str = "What's in this image?";
pub const REPLY_FALLBACK: &str = "Sorry, I encountered an error. Please try again.";
pub const IMAGE_FALLBACK: &str = "Sorry, I couldn't analyze that image. Please try another one.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatPrompts {
    pub system_prompt: String,
    pub vision_prompt: String,
}

impl Default for ChatPrompts {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            vision_prompt: DEFAULT_VISION_PROMPT.to_string(),
        }
    }
}

/// Result of a send as the caller sees it. Failures are already rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Blank input; nothing happened.
    Ignored,
    /// The session already has a reply in flight; nothing was appended.
    Busy,
    /// The stored assistant reply.
    Replied(String),
    /// The turn failed and the fallback text was shown instead.
    Fallback,
}

pub struct ChatSessionManager {
    context: Mutex<SessionContext>,
    store: Arc<dyn ChatStore>,
    client: ArcSwap<Arc<dyn CompletionClient>>,
    renderer: Arc<dyn ViewRenderer>,
    assembler: MessageStreamAssembler,
    vision_prompt: String,
    message_slot: Mutex<SubscriptionSlot>,
    list_slot: Mutex<SubscriptionSlot>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ChatSessionManager {
    pub fn new(
        context: SessionContext,
        store: Arc<dyn ChatStore>,
        client: Arc<dyn CompletionClient>,
        renderer: Arc<dyn ViewRenderer>,
        prompts: ChatPrompts,
    ) -> Self {
        let assembler = MessageStreamAssembler::new(
            Arc::clone(&store),
            Arc::clone(&renderer),
            prompts.system_prompt,
        );
        Self {
            context: Mutex::new(context),
            store,
            client: ArcSwap::from_pointee(client),
            renderer,
            assembler,
            vision_prompt: prompts.vision_prompt,
            message_slot: Mutex::default(),
            list_slot: Mutex::default(),
        }
    }

    pub fn context(&self) -> SessionContext {
        lock(&self.context).clone()
    }

    pub fn current_session(&self) -> Option<SessionId> {
        lock(&self.context).current_session
    }

    pub fn set_temporary(&self, temporary: bool) {
        lock(&self.context).temporary = temporary;
        tracing::debug!(temporary, "temporary chat toggle changed");
    }

    /// Swaps the completion backend; replies already in flight keep the old one.
    pub fn replace_client(&self, client: Arc<dyn CompletionClient>) {
        self.client.store(Arc::new(client));
    }

    pub fn is_streaming(&self, session_id: SessionId) -> bool {
        self.assembler.is_streaming(session_id)
    }

    pub async fn create_session(&self, temporary: bool) -> ChatResult<SessionId> {
        let user_id = lock(&self.context).user_id.clone();
        let session = self
            .store
            .create_session(NewSession::new(user_id, temporary))
            .await
            .context(StoreUnavailableSnafu {
                stage: "create-session",
            })?;
        tracing::info!(session_id = %session.id, temporary, "session created");
        Ok(session.id)
    }

    /// Starts a fresh chat with the context's temporary toggle and makes it current.
    pub async fn new_chat(&self) -> Option<SessionId> {
        self.detach_current();
        let temporary = lock(&self.context).temporary;

        let session_id = match self.create_session(temporary).await {
            Ok(session_id) => session_id,
            Err(error) => {
                tracing::error!(error = %error, "failed to create new chat");
                return None;
            }
        };

        match self.load_session(session_id).await {
            Ok(()) => Some(session_id),
            Err(error) => {
                tracing::error!(session_id = %session_id, error = %error, "failed to open new chat");
                None
            }
        }
    }

    /// Makes `session_id` current and keeps the view in sync with its messages.
    ///
    /// The previous message subscription is cancelled before the new one is
    /// registered. On failure no session is current.
    pub async fn load_session(&self, session_id: SessionId) -> ChatResult<()> {
        self.detach_current();
        self.renderer.clear();

        let renderer = Arc::clone(&self.renderer);
        let listener: Listener<MessagesSnapshot> = Arc::new(move |snapshot: MessagesSnapshot| {
            if snapshot.is_empty() {
                renderer.render_empty_state();
            } else {
                renderer.render_messages(&snapshot);
            }
        });

        let subscription = self
            .store
            .subscribe_messages(session_id, listener)
            .await
            .context(StoreUnavailableSnafu {
                stage: "subscribe-messages",
            })?;

        lock(&self.message_slot).replace(subscription);
        lock(&self.context).current_session = Some(session_id);
        tracing::debug!(session_id = %session_id, "session loaded");
        Ok(())
    }

    /// Cancels the message subscription and forgets the current session.
    fn detach_current(&self) {
        if lock(&self.message_slot).clear() {
            tracing::debug!("previous message subscription cancelled");
        }
        lock(&self.context).current_session = None;
    }

    /// Keeps the chat list in sync; temporary sessions never reach the view.
    pub async fn list_sessions(&self) -> ChatResult<()> {
        let user_id = lock(&self.context).user_id.clone();
        let renderer = Arc::clone(&self.renderer);
        let listener: Listener<SessionsSnapshot> = Arc::new(move |snapshot: SessionsSnapshot| {
            let summaries = snapshot
                .iter()
                .filter(|session| !session.is_temporary)
                .map(SessionSummary::from_record)
                .collect::<Vec<_>>();
            renderer.render_session_list(&summaries);
        });

        let subscription = self
            .store
            .subscribe_sessions(user_id, listener)
            .await
            .context(StoreUnavailableSnafu {
                stage: "subscribe-sessions",
            })?;
        lock(&self.list_slot).replace(subscription);
        Ok(())
    }

    pub async fn send_user_message(&self, session_id: SessionId, text: &str) -> SendOutcome {
        let text = text.trim();
        if text.is_empty() {
            return SendOutcome::Ignored;
        }

        let ticket = match self.assembler.reserve(session_id) {
            Ok(ticket) => ticket,
            Err(error) => {
                tracing::warn!(session_id = %session_id, error = %error, "send rejected");
                return SendOutcome::Busy;
            }
        };

        let client = self.client.load_full();
        let result = self.run_text_turn(&**client, ticket, text).await;
        self.settle(session_id, result, REPLY_FALLBACK)
    }

    /// Asks the vision endpoint about `image` and stores the answer as one reply.
    pub async fn send_image_message(
        &self,
        session_id: SessionId,
        image: ImageAttachment,
    ) -> SendOutcome {
        let ticket = match self.assembler.reserve(session_id) {
            Ok(ticket) => ticket,
            Err(error) => {
                tracing::warn!(session_id = %session_id, error = %error, "image send rejected");
                return SendOutcome::Busy;
            }
        };

        let client = self.client.load_full();
        let result = self.run_image_turn(&**client, ticket, &image).await;
        self.settle(session_id, result, IMAGE_FALLBACK)
    }

    async fn run_text_turn(
        &self,
        client: &dyn CompletionClient,
        ticket: StreamTicket,
        text: &str,
    ) -> ChatResult<String> {
        let session_id = ticket.session_id();
        self.store
            .append_message(session_id, NewMessage::user(text))
            .await
            .context(StoreUnavailableSnafu {
                stage: "append-user-message",
            })?;
        // Read back so the context includes the message just appended.
        let history = self
            .store
            .load_messages(session_id)
            .await
            .context(StoreUnavailableSnafu {
                stage: "load-history",
            })?;
        self.assembler.assemble(client, ticket, &history).await
    }

    async fn run_image_turn(
        &self,
        client: &dyn CompletionClient,
        ticket: StreamTicket,
        image: &ImageAttachment,
    ) -> ChatResult<String> {
        let session_id = ticket.session_id();
        let thinking = ThinkingIndicator::show(Arc::clone(&self.renderer));
        let description = client
            .describe_image(image.data_url(), self.vision_prompt.clone())
            .await
            .context(CompletionFailedSnafu {
                stage: "describe-image",
            })?;
        drop(thinking);

        self.store
            .append_message(session_id, NewMessage::assistant(description.as_str()))
            .await
            .context(StoreUnavailableSnafu {
                stage: "append-image-reply",
            })?;
        tracing::info!(session_id = %session_id, reply_len = description.len(), "image reply stored");
        Ok(description)
    }

    fn settle(
        &self,
        session_id: SessionId,
        result: ChatResult<String>,
        fallback: &str,
    ) -> SendOutcome {
        match result {
            Ok(reply) => SendOutcome::Replied(reply),
            Err(error) => {
                log_turn_failure(session_id, &error);
                self.renderer.render_fallback(fallback);
                SendOutcome::Fallback
            }
        }
    }

    pub async fn delete_session(&self, session_id: SessionId) -> ChatResult<()> {
        self.store
            .delete_session(session_id)
            .await
            .context(StoreUnavailableSnafu {
                stage: "delete-session",
            })?;

        let was_current = {
            let mut context = lock(&self.context);
            let was_current = context.is_current(session_id);
            if was_current {
                context.current_session = None;
            }
            was_current
        };
        if was_current {
            lock(&self.message_slot).clear();
            self.renderer.clear();
        }

        tracing::info!(session_id = %session_id, was_current, "session deleted");
        Ok(())
    }

    /// Drops both subscriptions and forgets the current chat.
    pub fn shutdown(&self) {
        lock(&self.message_slot).clear();
        lock(&self.list_slot).clear();
        let mut context = lock(&self.context);
        context.current_session = None;
        context.temporary = false;
        tracing::debug!(user_id = %context.user_id, "chat manager shut down");
    }
}

fn log_turn_failure(session_id: SessionId, error: &ChatError) {
    match error {
        ChatError::CompletionFailed { .. } => {
            tracing::error!(session_id = %session_id, error = %error, "completion failed");
        }
        _ => {
            tracing::error!(session_id = %session_id, error = %error, "chat turn failed");
        }
    }
}
