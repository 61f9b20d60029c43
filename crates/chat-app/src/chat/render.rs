use std::sync::Arc;

use chrono::{DateTime, Utc};
use murmur_storage::{MessageRecord, SessionId, SessionRecord};

/// Previews longer than this many characters are cut and suffixed with `...`.
pub const PREVIEW_MAX_CHARS: usize = 50;
pub const EMPTY_PREVIEW: &str = "New chat";

/// Narrow contract through which the chat core drives a view.
///
/// Calls arrive from store listeners as well as from the send path, so
/// implementations synchronize internally.
pub trait ViewRenderer: Send + Sync {
    /// Replaces the message list with a full stored snapshot.
    fn render_messages(&self, messages: &[MessageRecord]);

    fn render_empty_state(&self);

    fn render_session_list(&self, sessions: &[SessionSummary]);

    fn clear(&self);

    fn show_thinking(&self);

    fn hide_thinking(&self);

    /// Replaces the in-progress assistant bubble with the full text so far.
    fn render_stream_text(&self, text: &str);

    /// Display-only message shown in place of the assistant reply. Never persisted.
    fn render_fallback(&self, text: &str);
}

/// One row of the chat list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub preview: String,
}

impl SessionSummary {
    pub fn from_record(record: &SessionRecord) -> Self {
        let preview = record
            .last_message()
            .map(|message| preview_text(&message.content.text()))
            .unwrap_or_else(|| EMPTY_PREVIEW.to_string());

        Self {
            id: record.id,
            created_at: record.created_at,
            preview,
        }
    }
}

pub fn preview_text(text: &str) -> String {
    if text.chars().count() > PREVIEW_MAX_CHARS {
        let cut = text.chars().take(PREVIEW_MAX_CHARS).collect::<String>();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}

/// Shows the thinking indicator for as long as the guard lives.
///
/// `dismiss` hides it early (first streamed content); dropping the guard hides it
/// on every other exit path. The renderer sees at most one hide per show.
pub struct ThinkingIndicator {
    renderer: Arc<dyn ViewRenderer>,
    visible: bool,
}

impl ThinkingIndicator {
    pub fn show(renderer: Arc<dyn ViewRenderer>) -> Self {
        renderer.show_thinking();
        Self {
            renderer,
            visible: true,
        }
    }

    pub fn dismiss(&mut self) {
        if self.visible {
            self.visible = false;
            self.renderer.hide_thinking();
        }
    }
}

impl Drop for ThinkingIndicator {
    fn drop(&mut self) {
        self.dismiss();
    }
}
