#![deny(unsafe_code)]

/// Chat session, turn orchestration and transcript rendering.
pub mod chat;
/// Client settings persistence.
pub mod settings;
pub mod terminal;
