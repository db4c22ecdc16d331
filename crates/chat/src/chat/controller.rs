use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ragchat_stream::{
    ChatEventStream, ChatMode, ChatRequest, ChatTransport, HandoffStatus, StreamClient,
    StreamError, StreamEventMapped, StreamEventPayload, StreamOptions, StreamRequest,
    StreamTarget, TurnId,
};
use snafu::{ResultExt, Snafu, ensure};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};

use crate::chat::message::MessageId;
use crate::chat::store::{MessageStore, Session, SessionSnapshot, StoreError, TurnOutcome};
use crate::settings::ClientSettings;

/// Template used when the backend cannot provide one.
pub const DEFAULT_RAG_PROMPT: &str = "You are a helpful assistant. Use the following context to answer the question at the end. If you don't know the answer, just say that you don't know, don't try to make up an answer.\n\nContext:\n{context}\n\nQuestion:\n{question}";

/// Sentence placed in the input by `request_human`.
pub const HUMAN_REQUEST_TEXT: &str = "I would like to speak to a human agent.";

pub type ControllerResult<T> = Result<T, ControllerError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ControllerError {
    #[snafu(display("a reply is still streaming for {target:?}"))]
    Busy {
        stage: &'static str,
        target: StreamTarget,
    },
    #[snafu(display("input is disabled while a human hand-off is pending"))]
    HandoffPending { stage: &'static str },
    #[snafu(display("failed to start stream on `{stage}`: {source}"))]
    StartStream {
        stage: &'static str,
        source: StreamError,
    },
    #[snafu(display("session rejected `{stage}`: {source}"))]
    Store {
        stage: &'static str,
        source: StoreError,
    },
}

struct ActiveTurn {
    target: StreamTarget,
    reader: AbortHandle,
}

struct ChatState {
    store: MessageStore,
    active: Option<ActiveTurn>,
}

/// Completion handle for one turn.
pub struct TurnHandle {
    reader: JoinHandle<TurnOutcome>,
}

impl TurnHandle {
    /// Resolves once the turn ended; an aborted reader reads as `Aborted`.
    pub async fn wait(self) -> TurnOutcome {
        self.reader.await.unwrap_or(TurnOutcome::Aborted)
    }
}

/// Binds user commands to stream turns and session mutations.
///
/// Turns are spawned on the ambient Tokio runtime, so every method that may
/// start one must be called from within it.
pub struct ChatController<T> {
    transport: Arc<T>,
    options: StreamOptions,
    user_id: Option<String>,
    state: Arc<Mutex<ChatState>>,
    next_turn: AtomicU64,
}

impl<T> ChatController<T>
where
    T: ChatTransport + 'static,
{
    pub fn new(transport: Arc<T>, settings: &ClientSettings) -> Self {
        let store = MessageStore::new(
            settings.default_mode,
            DEFAULT_RAG_PROMPT,
            settings.greeting.as_deref(),
        );

        Self {
            transport,
            options: settings.stream_options(),
            user_id: settings.user_id.clone(),
            state: Arc::new(Mutex::new(ChatState {
                store,
                active: None,
            })),
            next_turn: AtomicU64::new(1),
        }
    }

    /// Seeds the prompt template from the backend, falling back to the default.
    pub async fn init(&self) -> String {
        let template = match self.transport.fetch_prompt().await {
            Ok(prompt) => prompt,
            Err(error) => {
                tracing::warn!(error = %error, "failed to fetch rag prompt, using default template");
                DEFAULT_RAG_PROMPT.to_string()
            }
        };

        lock_state(&self.state)
            .store
            .set_rag_prompt(template.clone());
        template
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        lock_state(&self.state).store.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        lock_state(&self.state).store.snapshot()
    }

    /// Sends `text` as a new turn; blank input is a no-op returning `None`.
    pub fn send(&self, text: &str) -> ControllerResult<Option<TurnHandle>> {
        let mut state = lock_state(&self.state);
        self.send_locked(&mut state, text)
    }

    /// Sends the current draft and clears it once the turn started.
    pub fn send_draft(&self) -> ControllerResult<Option<TurnHandle>> {
        let mut state = lock_state(&self.state);
        self.send_draft_locked(&mut state)
    }

    pub fn set_draft(&self, draft: impl Into<String>) {
        lock_state(&self.state).store.set_draft(draft);
    }

    /// Aborts the in-flight turn, if any, and starts an empty session.
    pub fn new_chat(&self) -> ControllerResult<()> {
        let mut state = lock_state(&self.state);
        if let Some(active) = state.active.take() {
            // Dropping the reader's event stream signals the worker to stop.
            active.reader.abort();
            state
                .store
                .finish_turn(active.target, &TurnOutcome::Aborted);
            tracing::debug!(target = ?active.target, "aborted turn for new chat");
        }

        state.store.reset().context(StoreSnafu { stage: "new-chat" })
    }

    pub fn set_mode(&self, mode: ChatMode) -> ControllerResult<()> {
        lock_state(&self.state)
            .store
            .set_mode(mode)
            .context(StoreSnafu { stage: "set-mode" })
    }

    pub fn set_rag_prompt(&self, template: impl Into<String>) {
        lock_state(&self.state).store.set_rag_prompt(template);
    }

    /// Pre-fills the canonical hand-off sentence and sends it.
    ///
    /// Does nothing once a hand-off is already pending.
    pub fn request_human(&self) -> ControllerResult<Option<TurnHandle>> {
        let mut state = lock_state(&self.state);
        if state.store.session().handoff_status == HandoffStatus::Pending {
            return Ok(None);
        }
        ensure_idle(state.store.session(), "request-human")?;

        state.store.set_draft(HUMAN_REQUEST_TEXT);
        self.send_draft_locked(&mut state)
    }

    fn send_draft_locked(&self, state: &mut ChatState) -> ControllerResult<Option<TurnHandle>> {
        let draft = state.store.session().draft.clone();
        let handle = self.send_locked(state, &draft)?;
        if handle.is_some() {
            state.store.clear_draft();
        }
        Ok(handle)
    }

    fn send_locked(
        &self,
        state: &mut ChatState,
        text: &str,
    ) -> ControllerResult<Option<TurnHandle>> {
        if text.trim().is_empty() {
            return Ok(None);
        }

        let session = state.store.session();
        ensure_idle(session, "send")?;
        ensure!(
            session.handoff_status != HandoffStatus::Pending,
            HandoffPendingSnafu { stage: "send" }
        );

        let mode = session.mode;
        let target = StreamTarget::new(
            session.epoch,
            TurnId::new(self.next_turn.fetch_add(1, Ordering::Relaxed)),
        );
        let request = StreamRequest::new(target, mode, self.build_request(session, text));

        state.store.append_user(text);
        let bot_id = state
            .store
            .begin_bot_reply(target)
            .context(StoreSnafu { stage: "begin-turn" })?;

        let client = StreamClient::new(Arc::clone(&self.transport), self.options.clone());
        let handle = match client.stream_chat(request) {
            Ok(handle) => handle,
            Err(error) => {
                state
                    .store
                    .finish_turn(target, &TurnOutcome::from_error(&error));
                return Err(error).context(StartStreamSnafu { stage: "send" });
            }
        };

        tokio::spawn(handle.worker);
        let reader = tokio::spawn(read_turn(Arc::clone(&self.state), handle.stream, bot_id));
        state.active = Some(ActiveTurn {
            target,
            reader: reader.abort_handle(),
        });

        tracing::debug!(target = ?target, mode = mode.as_str(), "turn started");
        Ok(Some(TurnHandle { reader }))
    }

    fn build_request(&self, session: &Session, text: &str) -> ChatRequest {
        let mut body = ChatRequest::new(text).with_conversation_id(session.conversation_id.clone());
        if session.mode == ChatMode::Rag && !session.rag_prompt_template.trim().is_empty() {
            body = body.with_rag_prompt(session.rag_prompt_template.clone());
        }
        if let Some(user_id) = &self.user_id {
            body = body.with_user_id(user_id.clone());
        }
        body
    }
}

fn ensure_idle(session: &Session, stage: &'static str) -> ControllerResult<()> {
    match session.turn.active_target() {
        Some(target) => BusySnafu { stage, target }.fail(),
        None => Ok(()),
    }
}

fn lock_state(state: &Mutex<ChatState>) -> MutexGuard<'_, ChatState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn read_turn(
    state: Arc<Mutex<ChatState>>,
    mut stream: ChatEventStream,
    bot_id: MessageId,
) -> TurnOutcome {
    let target = stream.target();
    while let Some(event) = stream.recv().await {
        if let Some(outcome) = apply_stream_event(&state, bot_id, event) {
            return outcome;
        }
    }

    let error = StreamError::UnterminatedStream { stage: "read-turn" };
    tracing::warn!(target = ?target, error = %error, "turn reader closed early");
    let outcome = TurnOutcome::from_error(&error);
    finish_active(&mut lock_state(&state), target, &outcome);
    outcome
}

/// Applies one event under the lock; returns the outcome once the turn ended.
fn apply_stream_event(
    state: &Mutex<ChatState>,
    bot_id: MessageId,
    event: StreamEventMapped,
) -> Option<TurnOutcome> {
    let mut state = lock_state(state);
    let outcome = match event.payload {
        StreamEventPayload::Event(chat_event) => {
            state.store.on_event(event.target, bot_id, chat_event);
            return None;
        }
        StreamEventPayload::Done => TurnOutcome::Completed,
        StreamEventPayload::Failed(error) => TurnOutcome::from_error(&error),
    };

    finish_active(&mut state, event.target, &outcome);
    Some(outcome)
}

fn finish_active(state: &mut ChatState, target: StreamTarget, outcome: &TurnOutcome) {
    state.store.finish_turn(target, outcome);
    if state
        .active
        .as_ref()
        .is_some_and(|active| active.target == target)
    {
        state.active = None;
    }
}
