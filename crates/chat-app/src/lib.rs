#![deny(unsafe_code)]

/// Chat core: session manager, stream assembler, and the view contract.
pub mod chat;
/// Layered settings persisted as JSON.
pub mod settings;
/// Terminal front end.
pub mod terminal;
