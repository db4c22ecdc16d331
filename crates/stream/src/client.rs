use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use crate::error::{
    AbortedSnafu, DecodeSnafu, EmptyMessageSnafu, IdleTimeoutSnafu, StreamError, StreamResult,
};
use crate::event::{ChatEvent, StreamEventMapped, StreamEventPayload, StreamTarget};
use crate::parser::{DEFAULT_MAX_RECORD_BYTES, FrameParser};
use crate::request::StreamRequest;
use crate::transport::{ByteStream, ChatTransport};

pub type StreamWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOptions {
    /// Longest allowed gap between two body chunks; `None` waits forever.
    pub idle_timeout: Option<Duration>,
    pub max_record_bytes: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
        }
    }
}

/// Receiving half of one stream; dropping it aborts the worker.
pub struct ChatEventStream {
    target: StreamTarget,
    events: mpsc::UnboundedReceiver<StreamEventMapped>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct StreamHandle {
    pub stream: ChatEventStream,
    pub worker: StreamWorker,
}

impl ChatEventStream {
    pub(crate) fn new(
        target: StreamTarget,
        events: mpsc::UnboundedReceiver<StreamEventMapped>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            target,
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn target(&self) -> StreamTarget {
        self.target
    }

    pub async fn recv(&mut self) -> Option<StreamEventMapped> {
        self.events.recv().await
    }

    /// Asks the worker to stop; it answers with a terminal `Aborted` failure.
    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for ChatEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// One-shot client for a single chat turn.
///
/// `stream_chat` consumes the client, so a second run on the same client (and
/// the same parser buffer) cannot be started.
pub struct StreamClient<T> {
    transport: Arc<T>,
    options: StreamOptions,
}

impl<T> StreamClient<T>
where
    T: ChatTransport + 'static,
{
    pub fn new(transport: Arc<T>, options: StreamOptions) -> Self {
        Self { transport, options }
    }

    /// Prepares the request; no I/O happens until `worker` is polled.
    pub fn stream_chat(self, request: StreamRequest) -> StreamResult<StreamHandle> {
        ensure!(
            !request.body.message.trim().is_empty(),
            EmptyMessageSnafu {
                stage: "stream-chat",
                target: format!("{:?}", request.target),
            }
        );

        let (event_tx, stream, cancel_rx) = make_event_stream(request.target);
        let worker: StreamWorker = Box::pin(run_stream_worker(
            self.transport,
            self.options,
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(StreamHandle { stream, worker })
    }
}

async fn run_stream_worker<T>(
    transport: Arc<T>,
    options: StreamOptions,
    request: StreamRequest,
    event_tx: mpsc::UnboundedSender<StreamEventMapped>,
    mut cancel_rx: oneshot::Receiver<()>,
) where
    T: ChatTransport + 'static,
{
    let target = request.target;
    tracing::debug!(
        target = ?target,
        mode = request.mode.as_str(),
        "opening chat stream"
    );

    let payload = match pump_events(&*transport, &options, &request, &event_tx, &mut cancel_rx)
        .await
    {
        Ok(()) => {
            tracing::debug!(target = ?target, "chat stream completed");
            StreamEventPayload::Done
        }
        Err(error) => {
            match &error {
                StreamError::Aborted { .. } => {
                    tracing::debug!(target = ?target, "chat stream cancelled");
                }
                _ => {
                    tracing::warn!(
                        target = ?target,
                        kind = ?error.kind(),
                        error = %error,
                        "chat stream failed"
                    );
                }
            }
            StreamEventPayload::Failed(error)
        }
    };

    let _ = event_tx.send(StreamEventMapped { target, payload });
}

async fn pump_events<T>(
    transport: &T,
    options: &StreamOptions,
    request: &StreamRequest,
    event_tx: &mpsc::UnboundedSender<StreamEventMapped>,
    cancel_rx: &mut oneshot::Receiver<()>,
) -> StreamResult<()>
where
    T: ChatTransport,
{
    let target = request.target;

    let mut body = tokio::select! {
        _ = &mut *cancel_rx => return AbortedSnafu { stage: "open-stream" }.fail(),
        opened = transport.open_stream(request.mode, &request.body) => opened?,
    };

    let mut parser = FrameParser::with_max_record_bytes(options.max_record_bytes);

    loop {
        let next = tokio::select! {
            _ = &mut *cancel_rx => return AbortedSnafu { stage: "read-body" }.fail(),
            next = next_chunk(&mut body, options.idle_timeout) => next?,
        };

        match next {
            Some(chunk) => {
                let events = parser.feed(&chunk).context(DecodeSnafu {
                    stage: "feed-chunk",
                })?;
                forward_events(event_tx, target, events)?;
            }
            None => {
                let events = parser.flush().context(DecodeSnafu {
                    stage: "flush-parser",
                })?;
                forward_events(event_tx, target, events)?;
                return Ok(());
            }
        }
    }
}

async fn next_chunk(
    body: &mut ByteStream,
    idle_timeout: Option<Duration>,
) -> StreamResult<Option<Bytes>> {
    let next = match idle_timeout {
        Some(timeout) => tokio::time::timeout(timeout, body.next())
            .await
            .map_err(|_| {
                IdleTimeoutSnafu {
                    stage: "await-chunk",
                    timeout,
                }
                .build()
            })?,
        None => body.next().await,
    };

    next.transpose()
}

fn forward_events(
    event_tx: &mpsc::UnboundedSender<StreamEventMapped>,
    target: StreamTarget,
    events: Vec<ChatEvent>,
) -> StreamResult<()> {
    for event in events {
        let mapped = StreamEventMapped {
            target,
            payload: StreamEventPayload::Event(event),
        };
        if event_tx.send(mapped).is_err() {
            // Receiver is gone; nobody can observe further events.
            return AbortedSnafu {
                stage: "forward-event",
            }
            .fail();
        }
    }

    Ok(())
}

pub(crate) fn make_event_stream(
    target: StreamTarget,
) -> (
    mpsc::UnboundedSender<StreamEventMapped>,
    ChatEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        ChatEventStream::new(target, event_rx, cancel_tx),
        cancel_rx,
    )
}
