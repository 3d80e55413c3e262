//! Generation protocol: streaming token production on the lane.
//!
//! Per call:
//! 1. Allocate a scratch batch
//! 2. Prime the engine with the prompt, yielding the initial cursor
//! 3. Step the decoder one token at a time, emitting each piece immediately
//! 4. Clear the KV cache, then free the batch, on every exit path
//!
//! Tokens travel to the caller over an unbounded channel, so a slow consumer
//! never stalls the lane. Cancellation is a flag checked before each step;
//! dropping the [`TokenStream`] sets it too.

use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Instant;

use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engine::{DecodeStep, Handle, NativeEngine};
use crate::session::lane::guarded;
use crate::session::state::{BatchHandle, SessionState};
use crate::session::SessionError;

/// Why a generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The engine reported end of sequence.
    EndOfSequence,
    /// The cursor reached `max_tokens`.
    MaxTokens,
    /// The caller cancelled or dropped the stream.
    Cancelled,
    /// Nothing was loaded; the stream is empty.
    NotLoaded,
    /// A native step failed; the error was the stream's last item.
    Failed,
}

impl FinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FinishReason::EndOfSequence => "stop",
            FinishReason::MaxTokens => "length",
            FinishReason::Cancelled => "cancelled",
            FinishReason::NotLoaded => "not_loaded",
            FinishReason::Failed => "error",
        }
    }
}

/// Reported once a stream has ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationSummary {
    pub finish_reason: FinishReason,

    /// Prompt tokens consumed by priming (the initial cursor).
    pub prompt_tokens: usize,

    /// Token pieces emitted to the stream.
    pub completion_tokens: usize,
}

/// Cooperative cancellation flag shared between a stream and its producer.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Events from the lane to a [`TokenStream`].
#[derive(Debug)]
pub(crate) enum GenerationEvent {
    Token(String),
    Error(SessionError),
    Done(GenerationSummary),
}

/// Lane-side sending half of a generation.
pub(crate) struct EventSink {
    tx: mpsc::UnboundedSender<GenerationEvent>,
    cancel: CancelHandle,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<GenerationEvent>, cancel: CancelHandle) -> Self {
        Self { tx, cancel }
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    /// Returns false once the consumer is gone.
    fn emit(&self, event: GenerationEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// End a stream that never reached the engine.
    pub(crate) fn fail(self, err: SessionError) {
        self.emit(GenerationEvent::Error(err));
        self.emit(GenerationEvent::Done(GenerationSummary {
            finish_reason: FinishReason::Failed,
            prompt_tokens: 0,
            completion_tokens: 0,
        }));
    }
}

/// Parameters of one queued generation.
#[derive(Debug, Clone)]
pub(crate) struct GenerationRequest {
    pub(crate) prompt: String,
    pub(crate) max_tokens: i32,
    pub(crate) batch_capacity: u32,
}

/// Position within one generation call. Never outlives the call.
#[derive(Debug)]
pub(crate) struct GenerationCursor {
    position: i32,
    limit: i32,
}

impl GenerationCursor {
    /// Validate the value returned by priming: at least one prompt token, and
    /// no more than the limit.
    pub(crate) fn prime(initial: i32, limit: i32) -> Result<Self, SessionError> {
        if initial < 1 || initial > limit {
            return Err(SessionError::PromptEncode {
                cursor: initial,
                limit,
            });
        }
        Ok(Self {
            position: initial,
            limit,
        })
    }

    pub(crate) fn position(&self) -> i32 {
        self.position
    }

    pub(crate) fn advance(&mut self) {
        self.position += 1;
    }

    pub(crate) fn exhausted(&self) -> bool {
        self.position > self.limit
    }
}

/// Clears the KV cache when the generation ends, however it ends.
///
/// Fields drop after `drop` returns, so the batch is freed after the clear.
struct GenerationScope<E: NativeEngine> {
    engine: Rc<E>,
    context: Handle,
    batch: BatchHandle<E>,
}

impl<E: NativeEngine> Drop for GenerationScope<E> {
    fn drop(&mut self) {
        if let Err(e) = self.engine.clear_kv_cache(self.context) {
            warn!(context = %self.context, "KV cache clear failed: {e}");
        }
        debug!(batch = %self.batch.handle(), "Releasing generation batch");
    }
}

#[derive(Debug, Default)]
struct Progress {
    prompt_tokens: usize,
    completion_tokens: usize,
}

/// Run one generation to completion on the lane.
pub(crate) fn run<E: NativeEngine>(
    engine: &Rc<E>,
    state: &SessionState<E>,
    request: &GenerationRequest,
    sink: &EventSink,
) {
    let Some(loaded) = state.loaded() else {
        warn!("generate() called with no model loaded; returning an empty stream");
        sink.emit(GenerationEvent::Done(GenerationSummary {
            finish_reason: FinishReason::NotLoaded,
            prompt_tokens: 0,
            completion_tokens: 0,
        }));
        return;
    };

    let start = Instant::now();
    let mut progress = Progress::default();
    let result = guarded(|| decode_loop(engine, loaded.context(), request, sink, &mut progress));

    let finish_reason = match result {
        Ok(reason) => reason,
        Err(SessionError::Cancelled) => {
            sink.emit(GenerationEvent::Error(SessionError::Cancelled));
            FinishReason::Cancelled
        }
        Err(err) => {
            warn!(error = %err, "Generation failed");
            sink.emit(GenerationEvent::Error(err));
            FinishReason::Failed
        }
    };

    info!(
        finish_reason = finish_reason.as_str(),
        prompt_tokens = progress.prompt_tokens,
        completion_tokens = progress.completion_tokens,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Generation complete"
    );

    sink.emit(GenerationEvent::Done(GenerationSummary {
        finish_reason,
        prompt_tokens: progress.prompt_tokens,
        completion_tokens: progress.completion_tokens,
    }));
}

fn decode_loop<E: NativeEngine>(
    engine: &Rc<E>,
    context: Handle,
    request: &GenerationRequest,
    sink: &EventSink,
    progress: &mut Progress,
) -> Result<FinishReason, SessionError> {
    let scope = GenerationScope {
        engine: Rc::clone(engine),
        context,
        batch: BatchHandle::allocate(engine, request.batch_capacity)?,
    };
    let batch = scope.batch.handle();

    let initial = engine.prime_completion(context, batch, &request.prompt, request.max_tokens);
    let mut cursor = GenerationCursor::prime(initial, request.max_tokens)?;
    progress.prompt_tokens = cursor.position() as usize;
    debug!(prompt_tokens = cursor.position(), max_tokens = request.max_tokens, "Prompt primed");

    while !cursor.exhausted() {
        if sink.cancelled() {
            return Err(SessionError::Cancelled);
        }

        let step = engine
            .decode_step(context, batch, request.max_tokens, cursor.position())
            .map_err(SessionError::Decode)?;
        cursor.advance();

        match step {
            DecodeStep::EndOfSequence => return Ok(FinishReason::EndOfSequence),
            DecodeStep::LimitReached => return Ok(FinishReason::MaxTokens),
            // Partial multi-byte character; the engine emits it with the next piece.
            DecodeStep::Piece(piece) if piece.is_empty() => {}
            DecodeStep::Piece(piece) => {
                progress.completion_tokens += 1;
                if !sink.emit(GenerationEvent::Token(piece)) {
                    return Err(SessionError::Cancelled);
                }
            }
        }
    }

    Ok(FinishReason::MaxTokens)
}

/// The caller's half of a generation: a stream of token pieces.
///
/// Yields `Ok(piece)` per token. An `Err` item, if any, is always last.
/// Dropping the stream cancels the generation.
pub struct TokenStream {
    events: mpsc::UnboundedReceiver<GenerationEvent>,
    cancel: CancelHandle,
    summary: Option<GenerationSummary>,
}

impl TokenStream {
    pub(crate) fn new(events: mpsc::UnboundedReceiver<GenerationEvent>, cancel: CancelHandle) -> Self {
        Self {
            events,
            cancel,
            summary: None,
        }
    }

    /// Ask the lane to stop before its next decode step.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Available once the stream has returned `None`.
    pub fn summary(&self) -> Option<&GenerationSummary> {
        self.summary.as_ref()
    }

    /// Drain the stream into one string.
    pub async fn collect_text(mut self) -> Result<(String, GenerationSummary), SessionError> {
        let mut text = String::new();
        while let Some(piece) = self.next().await {
            text.push_str(&piece?);
        }
        let summary = self.summary.take().ok_or(SessionError::LaneClosed)?;
        Ok((text, summary))
    }
}

impl Stream for TokenStream {
    type Item = Result<String, SessionError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match ready!(self.events.poll_recv(cx)) {
                Some(GenerationEvent::Token(piece)) => return Poll::Ready(Some(Ok(piece))),
                Some(GenerationEvent::Error(err)) => return Poll::Ready(Some(Err(err))),
                Some(GenerationEvent::Done(summary)) => self.summary = Some(summary),
                None => return Poll::Ready(None),
            }
        }
    }
}

impl Drop for TokenStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
