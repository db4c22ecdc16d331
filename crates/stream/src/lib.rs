#![deny(unsafe_code)]

//! Streaming protocol client for the RAG chat backend.
//!
//! A turn is one POST to a stream endpoint whose `text/event-stream` body is
//! decoded by [`FrameParser`] and forwarded, in byte order, through a
//! [`ChatEventStream`]. The I/O runs in the [`StreamWorker`] future so callers
//! decide where it is spawned.

mod client;
mod error;
mod event;
mod parser;
mod request;
mod transport;

pub use client::{ChatEventStream, StreamClient, StreamHandle, StreamOptions, StreamWorker};
pub use error::{
    ApiError, ApiResult, BoxError, FailureKind, FrameError, FrameResult, StreamError,
    StreamResult,
};
pub use event::{
    ChatEvent, HandoffStatus, SessionEpoch, StreamEventMapped, StreamEventPayload, StreamTarget,
    TurnId,
};
pub use parser::{DEFAULT_MAX_RECORD_BYTES, FrameParser};
pub use request::{
    AGENT_STREAM_PATH, ChatMode, ChatRequest, DEFAULT_BASE_URL, DocumentReceipt, HEALTH_PATH,
    RAG_PROMPT_PATH, RAG_STREAM_PATH, StreamRequest, UPLOAD_PATH,
};
pub use transport::{
    BoxFuture, ByteStream, ChatTransport, EVENT_STREAM_MIME, HttpTransport,
    SUPPORTED_DOCUMENT_EXTENSIONS, TransportConfig, is_supported_document,
};
