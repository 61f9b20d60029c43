use std::io::{self, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};

use murmur_storage::{MessageRecord, MessageRole, SessionId};

use crate::chat::{SessionSummary, ViewRenderer};

#[derive(Debug, Default)]
struct ViewState {
    /// Stored messages of the current chat already printed.
    shown: usize,
    /// Assistant text printed live while streaming, not yet matched to a stored message.
    streamed: Option<String>,
    thinking: bool,
    sessions: Vec<SessionSummary>,
    list_requested: bool,
}

/// Line-oriented view on stdout.
///
/// Store snapshots are authoritative, so every render diffs against what has
/// already been printed instead of reprinting the whole chat.
#[derive(Debug, Default)]
pub struct TerminalRenderer {
    state: Mutex<ViewState>,
}

impl TerminalRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ViewState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Session id at a 0-based position of the last rendered list.
    pub fn session_at(&self, index: usize) -> Option<SessionId> {
        self.state().sessions.get(index).map(|session| session.id)
    }

    /// Prints the latest chat-list snapshot.
    pub fn request_list(&self) {
        let mut state = self.state();
        state.list_requested = true;
        let sessions = state.sessions.clone();
        print_session_list(&mut state, &sessions);
    }

    pub fn notice(&self, text: &str) {
        let mut out = io::stdout().lock();
        let _ = writeln!(out, "* {text}");
        let _ = out.flush();
    }
}

fn role_label(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => "system",
        MessageRole::User => "you",
        MessageRole::Assistant => "assistant",
    }
}

fn print_session_list(state: &mut ViewState, sessions: &[SessionSummary]) {
    if !state.list_requested {
        return;
    }
    state.list_requested = false;

    let mut out = io::stdout().lock();
    if sessions.is_empty() {
        let _ = writeln!(out, "* no saved chats");
    }
    for (index, session) in sessions.iter().enumerate() {
        let _ = writeln!(
            out,
            "{:>3}. {}  {}",
            index + 1,
            session.created_at.format("%Y-%m-%d %H:%M"),
            session.preview
        );
    }
    let _ = out.flush();
}

impl ViewRenderer for TerminalRenderer {
    fn render_messages(&self, messages: &[MessageRecord]) {
        let mut state = self.state();
        if messages.len() < state.shown {
            state.shown = 0;
        }

        let mut out = io::stdout().lock();
        for message in &messages[state.shown..] {
            let text = message.content.text();
            if message.role == MessageRole::Assistant
                && state.streamed.as_deref() == Some(text.as_str())
            {
                state.streamed = None;
                let _ = writeln!(out);
                continue;
            }
            let _ = writeln!(out, "{}: {text}", role_label(message.role));
        }
        let _ = out.flush();
        state.shown = messages.len();
    }

    fn render_empty_state(&self) {
        let mut state = self.state();
        state.shown = 0;
        state.streamed = None;
        let mut out = io::stdout().lock();
        let _ = writeln!(out, "* empty chat, say something");
        let _ = out.flush();
    }

    fn render_session_list(&self, sessions: &[SessionSummary]) {
        let mut state = self.state();
        state.sessions = sessions.to_vec();
        print_session_list(&mut state, sessions);
    }

    fn clear(&self) {
        let mut state = self.state();
        state.shown = 0;
        state.streamed = None;
        let mut out = io::stdout().lock();
        let _ = writeln!(out, "----");
        let _ = out.flush();
    }

    fn show_thinking(&self) {
        let mut state = self.state();
        state.thinking = true;
        let mut out = io::stdout().lock();
        let _ = write!(out, "assistant is thinking...");
        let _ = out.flush();
    }

    fn hide_thinking(&self) {
        let mut state = self.state();
        if !state.thinking {
            return;
        }
        state.thinking = false;
        let mut out = io::stdout().lock();
        // Erase the indicator line in place.
        let _ = write!(out, "\r\x1b[2K");
        let _ = out.flush();
    }

    fn render_stream_text(&self, text: &str) {
        let mut state = self.state();
        let mut out = io::stdout().lock();
        match state.streamed.as_deref() {
            Some(previous) if text.starts_with(previous) => {
                let _ = write!(out, "{}", &text[previous.len()..]);
            }
            Some(_) => {
                let _ = write!(out, "\nassistant: {text}");
            }
            None => {
                let _ = write!(out, "assistant: {text}");
            }
        }
        let _ = out.flush();
        state.streamed = Some(text.to_string());
    }

    fn render_fallback(&self, text: &str) {
        let mut state = self.state();
        let partial = state.streamed.take();
        let mut out = io::stdout().lock();
        let _ = write!(out, "{}", fallback_output(partial.as_deref(), text));
        let _ = out.flush();
    }
}

/// Bytes that replace a partially streamed reply with `text`.
///
/// The partial reply starts at `assistant: ` on its first line; every line it
/// spans is erased before the fallback is printed.
fn fallback_output(partial: Option<&str>, text: &str) -> String {
    let mut output = String::new();
    if let Some(partial) = partial {
        output.push_str("\r\x1b[2K");
        for _ in 0..partial.matches('\n').count() {
            output.push_str("\x1b[1A\x1b[2K");
        }
    }
    output.push_str("assistant: ");
    output.push_str(text);
    output.push('\n');
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_without_partial_prints_one_line() {
        assert_eq!(
            fallback_output(None, "Sorry"),
            "assistant: Sorry\n"
        );
    }

    #[test]
    fn fallback_erases_partial_reply() {
        assert_eq!(
            fallback_output(Some("Hel"), "Sorry"),
            "\r\x1b[2Kassistant: Sorry\n"
        );
        assert_eq!(
            fallback_output(Some("one\ntwo\nthr"), "Sorry"),
            "\r\x1b[2K\x1b[1A\x1b[2K\x1b[1A\x1b[2Kassistant: Sorry\n"
        );
    }

    #[test]
    fn partial_reply_is_not_printed_again_after_failure() {
        let renderer = TerminalRenderer::new();
        renderer.render_stream_text("Hel");
        renderer.render_fallback("Sorry");
        assert!(renderer.state().streamed.is_none());
    }
}
