use std::path::PathBuf;
use std::time::Duration;

use snafu::Snafu;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type FrameResult<T> = Result<T, FrameError>;
pub type StreamResult<T> = Result<T, StreamError>;
pub type ApiResult<T> = Result<T, ApiError>;

/// Failures raised while decoding the event stream.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FrameError {
    #[snafu(display("event stream is not valid UTF-8 at byte {offset} on `{stage}`: {source}"))]
    InvalidUtf8 {
        stage: &'static str,
        offset: u64,
        source: std::str::Utf8Error,
    },
    #[snafu(display("event stream ended inside a UTF-8 sequence ({pending} bytes pending)"))]
    TruncatedUtf8 {
        stage: &'static str,
        pending: usize,
    },
    #[snafu(display("malformed event record on `{stage}`: {details}"))]
    MalformedRecord {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("event record exceeds {limit} bytes ({buffered} buffered)"))]
    RecordTooLarge {
        stage: &'static str,
        limit: usize,
        buffered: usize,
    },
}

/// User-facing classification of a failed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    TransportUnreachable,
    HttpError(u16),
    DecodeError,
    Aborted,
}

impl FailureKind {
    /// Text shown in the transcript; `None` for silent failures.
    pub fn user_message(self) -> Option<String> {
        match self {
            Self::TransportUnreachable => Some(
                "Could not connect to the server. Check that the backend is running.".to_string(),
            ),
            Self::HttpError(status) => Some(format!("Server returned {status}.")),
            Self::DecodeError => Some("Lost connection to the server.".to_string()),
            Self::Aborted => None,
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StreamError {
    #[snafu(display("stream request for {target} has an empty message"))]
    EmptyMessage {
        stage: &'static str,
        target: String,
    },
    #[snafu(display("failed to reach chat endpoint {url} on `{stage}`: {source}"))]
    Connect {
        stage: &'static str,
        url: String,
        #[snafu(source(from(reqwest::Error, Box::new)))]
        source: BoxError,
    },
    #[snafu(display("chat endpoint {url} returned status {status}"))]
    HttpStatus {
        stage: &'static str,
        url: String,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to decode event stream on `{stage}`: {source}"))]
    Decode {
        stage: &'static str,
        source: FrameError,
    },
    #[snafu(display("failed to read response body on `{stage}`: {source}"))]
    BodyRead {
        stage: &'static str,
        #[snafu(source(from(reqwest::Error, Box::new)))]
        source: BoxError,
    },
    #[snafu(display("no bytes received for {timeout:?} on `{stage}`"))]
    IdleTimeout {
        stage: &'static str,
        timeout: Duration,
    },
    #[snafu(display("event stream closed before a terminal signal on `{stage}`"))]
    UnterminatedStream { stage: &'static str },
    #[snafu(display("stream was aborted on `{stage}`"))]
    Aborted { stage: &'static str },
}

impl StreamError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::EmptyMessage { .. } | Self::Aborted { .. } => FailureKind::Aborted,
            Self::Connect { .. } => FailureKind::TransportUnreachable,
            Self::HttpStatus { status, .. } => FailureKind::HttpError(*status),
            Self::Decode { .. }
            | Self::BodyRead { .. }
            | Self::IdleTimeout { .. }
            | Self::UnterminatedStream { .. } => FailureKind::DecodeError,
        }
    }
}

/// Failures of the plain request/response endpoints (prompt, health, upload).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ApiError {
    #[snafu(display("failed to build HTTP client on `{stage}`: {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("request to {url} failed on `{stage}`: {source}"))]
    Request {
        stage: &'static str,
        url: String,
        source: reqwest::Error,
    },
    #[snafu(display("{url} returned status {status}"))]
    Status {
        stage: &'static str,
        url: String,
        status: u16,
    },
    #[snafu(display("failed to parse response from {url} on `{stage}`: {source}"))]
    Payload {
        stage: &'static str,
        url: String,
        source: reqwest::Error,
    },
    #[snafu(display("unsupported document {path:?}; expected one of: pdf, docx, txt"))]
    UnsupportedDocument { stage: &'static str, path: PathBuf },
    #[snafu(display("failed to read document {path:?} on `{stage}`: {source}"))]
    ReadDocument {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}
