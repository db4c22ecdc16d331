use crate::error::StreamError;

/// Counter bumped every time the chat session is reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SessionEpoch(pub u64);

impl SessionEpoch {
    /// Creates a typed session epoch.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

/// Identifier for one user turn and its streamed reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TurnId(pub u64);

impl TurnId {
    /// Creates a typed turn identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Stream routing key used for stale-event rejection.
///
/// A reset bumps the epoch, so events from a stream opened before the reset can
/// never match the active target again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamTarget {
    pub epoch: SessionEpoch,
    pub turn: TurnId,
}

impl StreamTarget {
    /// Creates the routing key for one turn of one session epoch.
    pub const fn new(epoch: SessionEpoch, turn: TurnId) -> Self {
        Self { epoch, turn }
    }
}

/// Hand-off state reported by the agent endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HandoffStatus {
    #[default]
    Inactive,
    Pending,
}

impl HandoffStatus {
    /// Parses a wire value; returns `None` for values the client does not know.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("pending") {
            Some(Self::Pending)
        } else if raw.eq_ignore_ascii_case("inactive") {
            Some(Self::Inactive)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Pending => "pending",
        }
    }
}

/// One decoded record of the chat event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// A fragment of the bot reply.
    Data(String),
    /// Server-assigned conversation identifier, already trimmed.
    ConversationId(String),
    HandoffStatus(HandoffStatus),
}

impl ChatEvent {
    /// Creates a data event carrying one reply fragment.
    pub fn data(payload: impl Into<String>) -> Self {
        Self::Data(payload.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Data(_) => "data",
            Self::ConversationId(_) => "conversation_id",
            Self::HandoffStatus(_) => "handoff_status",
        }
    }
}

/// Payload delivered to the stream consumer.
///
/// Every stream ends with exactly one `Done` or `Failed`.
#[derive(Debug)]
pub enum StreamEventPayload {
    Event(ChatEvent),
    Done,
    Failed(StreamError),
}

/// Emitted by the stream worker, tagged with the turn it belongs to.
#[derive(Debug)]
pub struct StreamEventMapped {
    pub target: StreamTarget,
    pub payload: StreamEventPayload,
}

impl StreamEventMapped {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.payload,
            StreamEventPayload::Done | StreamEventPayload::Failed(_)
        )
    }
}
