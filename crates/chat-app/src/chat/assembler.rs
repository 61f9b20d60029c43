use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use futures::StreamExt;
use murmur_llm::{
    CompletionClient, ImageUrl, ProviderContent, ProviderContentPart, ProviderMessage, Role,
    SseEvent, parse_event_line,
};
use murmur_storage::{
    ChatStore, ContentPart, MessageContent, MessageRecord, MessageRole, NewMessage, SessionId,
};
use snafu::{ResultExt, ensure};

use super::error::{ChatResult, CompletionFailedSnafu, StoreUnavailableSnafu, StreamInProgressSnafu};
use super::render::{ThinkingIndicator, ViewRenderer};

/// Accumulator for the in-flight assistant turn.
#[derive(Debug, Default)]
struct StreamState {
    text: String,
    chunks: usize,
}

impl StreamState {
    fn push(&mut self, chunk: &str) -> &str {
        self.text.push_str(chunk);
        self.chunks += 1;
        &self.text
    }

    fn finish(self) -> String {
        self.text
    }
}

type InFlight = Arc<Mutex<HashSet<SessionId>>>;

/// Exclusive right to run one completion against a session.
///
/// Released when dropped, whatever the outcome of the turn.
#[must_use = "dropping the ticket releases the session immediately"]
pub struct StreamTicket {
    session_id: SessionId,
    in_flight: InFlight,
}

impl StreamTicket {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }
}

impl Drop for StreamTicket {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.session_id);
    }
}

/// Builds the provider context for a stored history.
///
/// The system instruction leads the context only while the session has no
/// assistant reply yet.
pub fn build_context(history: &[MessageRecord], system_prompt: &str) -> Vec<ProviderMessage> {
    let needs_instruction = !history
        .iter()
        .any(|message| message.role == MessageRole::Assistant);

    let mut context = Vec::with_capacity(history.len() + 1);
    if needs_instruction {
        context.push(ProviderMessage::system(system_prompt));
    }
    context.extend(history.iter().map(to_provider_message));
    context
}

fn to_provider_message(message: &MessageRecord) -> ProviderMessage {
    let role = match message.role {
        MessageRole::System => Role::System,
        MessageRole::User => Role::User,
        MessageRole::Assistant => Role::Assistant,
    };
    let content = match &message.content {
        MessageContent::Text(text) => ProviderContent::Text(text.clone()),
        MessageContent::Parts(parts) => ProviderContent::Parts(
            parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => ProviderContentPart::Text { text: text.clone() },
                    ContentPart::ImageUrl { image_url } => ProviderContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: image_url.url.clone(),
                        },
                    },
                })
                .collect(),
        ),
    };
    ProviderMessage { role, content }
}

/// Turns a streamed completion into live view updates and one stored reply.
pub struct MessageStreamAssembler {
    store: Arc<dyn ChatStore>,
    renderer: Arc<dyn ViewRenderer>,
    system_prompt: String,
    in_flight: InFlight,
}

impl MessageStreamAssembler {
    pub fn new(
        store: Arc<dyn ChatStore>,
        renderer: Arc<dyn ViewRenderer>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            store,
            renderer,
            system_prompt: system_prompt.into(),
            in_flight: Arc::default(),
        }
    }

    pub fn is_streaming(&self, session_id: SessionId) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&session_id)
    }

    /// Claims the session for one turn, rejecting a second concurrent claim.
    pub fn reserve(&self, session_id: SessionId) -> ChatResult<StreamTicket> {
        let inserted = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id);
        ensure!(
            inserted,
            StreamInProgressSnafu {
                stage: "reserve-stream",
                session_id,
            }
        );

        Ok(StreamTicket {
            session_id,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// Streams a reply to `history` and appends it as one assistant message.
    ///
    /// Returns the stored text. On a transport failure nothing is stored and the
    /// partial text is discarded.
    pub async fn assemble(
        &self,
        client: &dyn CompletionClient,
        ticket: StreamTicket,
        history: &[MessageRecord],
    ) -> ChatResult<String> {
        let session_id = ticket.session_id();
        let context = build_context(history, &self.system_prompt);
        let mut thinking = ThinkingIndicator::show(Arc::clone(&self.renderer));

        tracing::debug!(
            session_id = %session_id,
            context_len = context.len(),
            "requesting completion"
        );

        let mut lines = client
            .stream_completion(context)
            .await
            .context(CompletionFailedSnafu {
                stage: "open-completion-stream",
            })?;

        let mut state = StreamState::default();
        while let Some(line) = lines.next().await {
            let line = line.context(CompletionFailedSnafu {
                stage: "read-completion-stream",
            })?;

            match parse_event_line(&line) {
                Ok(SseEvent::Skip) => {}
                Ok(SseEvent::Done) => break,
                Ok(SseEvent::Delta(chunk)) => {
                    thinking.dismiss();
                    let text = state.push(&chunk);
                    self.renderer.render_stream_text(text);
                }
                Err(error) => {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %error,
                        "skipping malformed stream chunk"
                    );
                }
            }
        }
        drop(lines);
        thinking.dismiss();

        let chunks = state.chunks;
        let text = state.finish();
        self.store
            .append_message(session_id, NewMessage::assistant(text.as_str()))
            .await
            .context(StoreUnavailableSnafu {
                stage: "append-assistant-message",
            })?;

        tracing::info!(
            session_id = %session_id,
            chunks,
            reply_len = text.len(),
            "assistant reply stored"
        );
        drop(ticket);
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn record(role: MessageRole, text: &str) -> MessageRecord {
        MessageRecord {
            seq: 0,
            role,
            content: MessageContent::from(text),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn instruction_leads_only_before_first_reply() {
        let first_turn = vec![record(MessageRole::User, "hi")];
        let context = build_context(&first_turn, "be brief");
        assert_eq!(context.len(), 2);
        assert_eq!(context[0], ProviderMessage::system("be brief"));
        assert_eq!(context[1], ProviderMessage::user("hi"));

        let later_turn = vec![
            record(MessageRole::User, "hi"),
            record(MessageRole::Assistant, "hello"),
            record(MessageRole::User, "again"),
            record(MessageRole::Assistant, "sure"),
            record(MessageRole::User, "more"),
        ];
        let context = build_context(&later_turn, "be brief");
        assert_eq!(context.len(), 5);
        assert!(context.iter().all(|message| message.role != Role::System));
    }

    #[test]
    fn image_parts_carry_over_to_provider_shape() {
        let message = MessageRecord {
            content: MessageContent::Parts(vec![ContentPart::ImageUrl {
                image_url: murmur_storage::ImageRef {
                    url: "data:image/png;base64,AAAA".into(),
                },
            }]),
            ..record(MessageRole::User, "")
        };
        let converted = to_provider_message(&message);
        assert_eq!(
            converted.content,
            ProviderContent::Parts(vec![ProviderContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "data:image/png;base64,AAAA".into()
                }
            }])
        );
    }

    #[test]
    fn stream_state_accumulates_in_order() {
        let mut state = StreamState::default();
        assert_eq!(state.push("Hel"), "Hel");
        assert_eq!(state.push("lo, "), "Hello, ");
        assert_eq!(state.push("world"), "Hello, world");
        assert_eq!(state.chunks, 3);
        assert_eq!(state.finish(), "Hello, world");
    }
}
