//! Chat core: session lifecycle, reply streaming, and the view contract.

pub mod assembler;
pub mod context;
pub mod error;
pub mod image;
pub mod manager;
pub mod render;

pub use assembler::{MessageStreamAssembler, StreamTicket, build_context};
pub use context::SessionContext;
pub use error::{ChatError, ChatResult};
pub use image::ImageAttachment;
pub use manager::{
    ChatPrompts, ChatSessionManager, DEFAULT_SYSTEM_PROMPT, DEFAULT_VISION_PROMPT, IMAGE_FALLBACK,
    REPLY_FALLBACK, SendOutcome,
};
pub use render::{SessionSummary, ThinkingIndicator, ViewRenderer, preview_text};
