use murmur_storage::SessionId;

/// Per-client session state owned by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub user_id: String,
    pub current_session: Option<SessionId>,
    /// Applied to chats created through `new_chat`.
    pub temporary: bool,
}

impl SessionContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            current_session: None,
            temporary: false,
        }
    }

    pub fn is_current(&self, session_id: SessionId) -> bool {
        self.current_session == Some(session_id)
    }
}
