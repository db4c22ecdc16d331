use std::sync::Arc;

use ragchat_stream::{
    ChatEvent, ChatMode, FailureKind, HandoffStatus, SessionEpoch, StreamError, StreamTarget,
};
use snafu::Snafu;
use tokio::sync::watch;

use crate::chat::message::{Message, MessageId, TurnState, TurnTransition, TurnTransitionRejection};

pub type SessionSnapshot = Arc<Session>;
pub type StoreResult<T> = Result<T, StoreError>;

/// Read model handed to the view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub messages: Vec<Message>,
    /// Assigned by the server on the first turn; write-once until reset.
    pub conversation_id: Option<String>,
    pub handoff_status: HandoffStatus,
    pub turn: TurnState,
    pub mode: ChatMode,
    pub rag_prompt_template: String,
    pub draft: String,
    pub epoch: SessionEpoch,
}

impl Session {
    pub fn loading(&self) -> bool {
        self.turn.is_loading()
    }

    /// Input is accepted only when idle and no human hand-off is pending.
    pub fn input_enabled(&self) -> bool {
        !self.loading() && self.handoff_status != HandoffStatus::Pending
    }

    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == id)
    }
}

/// How a turn ended, as seen by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Failed(FailureKind),
    Aborted,
}

impl TurnOutcome {
    pub fn from_error(error: &StreamError) -> Self {
        match error.kind() {
            FailureKind::Aborted => Self::Aborted,
            kind => Self::Failed(kind),
        }
    }

    fn transition(self, target: StreamTarget) -> TurnTransition {
        match self {
            Self::Completed => TurnTransition::Complete(target),
            Self::Failed(_) => TurnTransition::Fail(target),
            Self::Aborted => TurnTransition::Cancel(target),
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("cannot reset the session on `{stage}` while {target:?} is streaming"))]
    ResetWhileLoading {
        stage: &'static str,
        target: StreamTarget,
    },
    #[snafu(display("cannot switch to {mode:?} on `{stage}` while {target:?} is streaming"))]
    ModeChangeWhileLoading {
        stage: &'static str,
        mode: ChatMode,
        target: StreamTarget,
    },
    #[snafu(display("turn transition rejected on `{stage}`: {rejection:?}"))]
    TurnRejected {
        stage: &'static str,
        rejection: TurnTransitionRejection,
    },
}

/// Session aggregate that publishes a fresh snapshot after every mutation.
#[derive(Debug)]
pub struct MessageStore {
    session: Session,
    next_message_id: u64,
    publisher: watch::Sender<SessionSnapshot>,
}

impl MessageStore {
    pub fn new(
        mode: ChatMode,
        rag_prompt_template: impl Into<String>,
        greeting: Option<&str>,
    ) -> Self {
        let session = Session {
            messages: Vec::new(),
            conversation_id: None,
            handoff_status: HandoffStatus::Inactive,
            turn: TurnState::Idle,
            mode,
            rag_prompt_template: rag_prompt_template.into(),
            draft: String::new(),
            epoch: SessionEpoch::default(),
        };
        let (publisher, _) = watch::channel(Arc::new(session.clone()));
        let mut store = Self {
            session,
            next_message_id: 1,
            publisher,
        };

        if let Some(greeting) = greeting.map(str::trim).filter(|text| !text.is_empty()) {
            let id = store.alloc_message_id();
            store.session.messages.push(Message::bot(id, greeting));
            store.publish();
        }
        store
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.publisher.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.publisher.borrow().clone()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn append_user(&mut self, text: impl Into<String>) -> MessageId {
        let id = self.alloc_message_id();
        self.session.messages.push(Message::user(id, text));
        self.publish();
        id
    }

    /// Starts a turn and reserves the id of its bot reply.
    ///
    /// No row is inserted here; the first data event creates it.
    pub fn begin_bot_reply(&mut self, target: StreamTarget) -> StoreResult<MessageId> {
        self.transition(TurnTransition::Start(target), "begin-bot-reply")?;
        let id = self.alloc_message_id();
        self.publish();
        Ok(id)
    }

    /// Applies one decoded event; returns false when `target` is stale.
    pub fn on_event(&mut self, target: StreamTarget, bot_id: MessageId, event: ChatEvent) -> bool {
        if !self.session.turn.accepts_event(target) {
            tracing::debug!(
                target = ?target,
                kind = event.kind(),
                "dropping event for inactive turn"
            );
            return false;
        }

        match event {
            ChatEvent::ConversationId(id) => match &self.session.conversation_id {
                None => {
                    tracing::debug!(conversation_id = %id, "conversation assigned");
                    self.session.conversation_id = Some(id);
                }
                Some(current) if *current != id => {
                    tracing::debug!(
                        current = %current,
                        ignored = %id,
                        "conversation id already set"
                    );
                }
                Some(_) => {}
            },
            ChatEvent::HandoffStatus(status) => {
                self.session.handoff_status = status;
                if status == HandoffStatus::Pending {
                    self.mark_streaming(target);
                }
            }
            ChatEvent::Data(payload) => {
                match self
                    .session
                    .messages
                    .iter_mut()
                    .find(|message| message.id == bot_id)
                {
                    Some(message) => message.text.push_str(&payload),
                    None => self.session.messages.push(Message::bot(bot_id, payload)),
                }
                self.mark_streaming(target);
            }
        }

        self.publish();
        true
    }

    /// Ends the active turn; a failure adds one bot row with the error text.
    pub fn finish_turn(&mut self, target: StreamTarget, outcome: &TurnOutcome) -> bool {
        if self
            .transition(outcome.transition(target), "finish-turn")
            .is_err()
        {
            return false;
        }

        if let TurnOutcome::Failed(kind) = outcome
            && let Some(text) = kind.user_message()
        {
            let id = self.alloc_message_id();
            self.session.messages.push(Message::bot(id, text));
        }

        self.publish();
        true
    }

    /// Clears the transcript and conversation; the draft survives.
    pub fn reset(&mut self) -> StoreResult<()> {
        if let Some(target) = self.session.turn.active_target() {
            return ResetWhileLoadingSnafu {
                stage: "reset-session",
                target,
            }
            .fail();
        }

        self.session.messages.clear();
        self.session.conversation_id = None;
        self.session.handoff_status = HandoffStatus::Inactive;
        self.session.turn = TurnState::Idle;
        self.session.epoch = self.session.epoch.next();
        self.publish();
        Ok(())
    }

    pub fn set_mode(&mut self, mode: ChatMode) -> StoreResult<()> {
        if let Some(target) = self.session.turn.active_target() {
            return ModeChangeWhileLoadingSnafu {
                stage: "set-mode",
                mode,
                target,
            }
            .fail();
        }

        self.session.mode = mode;
        self.publish();
        Ok(())
    }

    pub fn set_rag_prompt(&mut self, template: impl Into<String>) {
        self.session.rag_prompt_template = template.into();
        self.publish();
    }

    pub fn set_draft(&mut self, draft: impl Into<String>) {
        self.session.draft = draft.into();
        self.publish();
    }

    pub fn clear_draft(&mut self) {
        if !self.session.draft.is_empty() {
            self.session.draft.clear();
            self.publish();
        }
    }

    fn transition(&mut self, transition: TurnTransition, stage: &'static str) -> StoreResult<()> {
        self.session.turn = self
            .session
            .turn
            .apply(transition)
            .map_err(|rejection| TurnRejectedSnafu { stage, rejection }.build())?;
        Ok(())
    }

    // Only called for an accepted event, so the target is the active one.
    fn mark_streaming(&mut self, target: StreamTarget) {
        if let Ok(turn) = self.session.turn.apply(TurnTransition::FirstData(target)) {
            self.session.turn = turn;
        }
    }

    fn alloc_message_id(&mut self) -> MessageId {
        let id = MessageId::new(self.next_message_id);
        self.next_message_id = self.next_message_id.saturating_add(1);
        id
    }

    fn publish(&self) {
        self.publisher.send_replace(Arc::new(self.session.clone()));
    }
}
