/// Turn orchestration between the stream client and the session.
pub mod controller;
/// Transcript rows and the per-turn state machine.
pub mod message;
pub mod render;
pub mod store;

pub use controller::{
    ChatController, ControllerError, ControllerResult, DEFAULT_RAG_PROMPT, HUMAN_REQUEST_TEXT,
    TurnHandle,
};
pub use message::{
    Message, MessageId, Sender, TurnState, TurnTransition, TurnTransitionRejection,
    TurnTransitionResult,
};
pub use render::{Segment, format_message, split_segments};
pub use store::{MessageStore, Session, SessionSnapshot, StoreError, StoreResult, TurnOutcome};
