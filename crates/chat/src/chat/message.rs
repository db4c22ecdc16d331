use chrono::Local;
use ragchat_stream::StreamTarget;

/// Wall-clock format used for message timestamps.
pub const TIMESTAMP_FORMAT: &str = "%H:%M:%S";

/// Stable identifier for one message.
///
/// Ids are never reused within a process, not even across a new chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

impl MessageId {
    /// Creates a typed message identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sender {
    User,
    Bot,
}

impl Sender {
    pub fn label(self) -> &'static str {
        match self {
            Self::User => "you",
            Self::Bot => "bot",
        }
    }

    pub fn is_bot(self) -> bool {
        matches!(self, Self::Bot)
    }
}

/// One transcript row.
///
/// User rows are immutable; bot rows only ever grow by appending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub from: Sender,
    pub text: String,
    pub timestamp: String,
}

impl Message {
    /// Creates a row stamped with the current local time.
    pub fn new(id: MessageId, from: Sender, text: impl Into<String>) -> Self {
        Self {
            id,
            from,
            text: text.into(),
            timestamp: Local::now().format(TIMESTAMP_FORMAT).to_string(),
        }
    }

    pub fn user(id: MessageId, text: impl Into<String>) -> Self {
        Self::new(id, Sender::User, text)
    }

    pub fn bot(id: MessageId, text: impl Into<String>) -> Self {
        Self::new(id, Sender::Bot, text)
    }
}

/// Lifecycle of the single turn a session may have in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnState {
    #[default]
    Idle,
    /// Request sent, no reply text yet.
    Awaiting(StreamTarget),
    /// At least one data event arrived.
    Streaming(StreamTarget),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnTransition {
    Start(StreamTarget),
    FirstData(StreamTarget),
    Complete(StreamTarget),
    Fail(StreamTarget),
    Cancel(StreamTarget),
    ResetToIdle,
}

/// Rejection reason for illegal turn transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnTransitionRejection {
    AlreadyActive {
        active: StreamTarget,
        attempted: StreamTarget,
    },
    NoActiveTurn,
    TargetMismatch {
        active: StreamTarget,
        attempted: StreamTarget,
    },
}

pub type TurnTransitionResult = Result<TurnState, TurnTransitionRejection>;

impl TurnState {
    pub fn active_target(&self) -> Option<StreamTarget> {
        match self {
            Self::Idle => None,
            Self::Awaiting(target) | Self::Streaming(target) => Some(*target),
        }
    }

    /// Returns true when an event tagged with `target` belongs to the live turn.
    pub fn accepts_event(&self, target: StreamTarget) -> bool {
        self.active_target() == Some(target)
    }

    pub fn is_loading(&self) -> bool {
        !matches!(self, Self::Idle)
    }

    /// Applies one transition deterministically.
    ///
    /// Only an idle session may start a turn, and every later transition must
    /// name the active target exactly.
    pub fn apply(&self, transition: TurnTransition) -> TurnTransitionResult {
        match transition {
            TurnTransition::Start(target) => match self.active_target() {
                Some(active) => Err(TurnTransitionRejection::AlreadyActive {
                    active,
                    attempted: target,
                }),
                None => Ok(Self::Awaiting(target)),
            },
            TurnTransition::FirstData(target) => {
                self.require_active(target)?;
                Ok(Self::Streaming(target))
            }
            TurnTransition::Complete(target)
            | TurnTransition::Fail(target)
            | TurnTransition::Cancel(target) => {
                self.require_active(target)?;
                Ok(Self::Idle)
            }
            TurnTransition::ResetToIdle => Ok(Self::Idle),
        }
    }

    fn require_active(&self, target: StreamTarget) -> Result<(), TurnTransitionRejection> {
        match self.active_target() {
            Some(active) if active == target => Ok(()),
            Some(active) => Err(TurnTransitionRejection::TargetMismatch {
                active,
                attempted: target,
            }),
            None => Err(TurnTransitionRejection::NoActiveTurn),
        }
    }
}
