//! HTTP front-end over the session API.
//!
//! - [`api`]: request/response types and route handlers
//! - [`streaming`]: SSE streaming for token-by-token responses
//! - [`transcript`]: the conversation log
//! - [`metrics`]: Prometheus counters

pub mod api;
pub mod metrics;
pub mod streaming;
pub mod transcript;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::debug;
use uuid::Uuid;

use crate::config::Config;
use crate::engine::NativeEngine;
use crate::session::{CancelHandle, FinishReason, GenerationSummary, SessionError, SessionManager, TokenStream};
use metrics::SessionMetrics;
use transcript::Transcript;

/// Application state shared across handlers.
pub struct AppState<E: NativeEngine> {
    pub session: SessionManager<E>,
    pub config: Arc<Config>,
    pub metrics: SessionMetrics,
    pub start_time: Instant,
    transcript: Mutex<Transcript>,
    /// Request id and cancel handle of the generation currently streaming.
    active: Mutex<Option<(Uuid, CancelHandle)>>,
    loading: AtomicBool,
}

impl<E: NativeEngine> AppState<E> {
    pub fn new(session: SessionManager<E>, config: Arc<Config>) -> prometheus::Result<Self> {
        Ok(Self {
            session,
            config,
            metrics: SessionMetrics::new()?,
            start_time: Instant::now(),
            transcript: Mutex::new(Transcript::new()),
            active: Mutex::new(None),
            loading: AtomicBool::new(false),
        })
    }

    pub fn transcript(&self) -> MutexGuard<'_, Transcript> {
        self.transcript.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cancel the generation currently streaming, if any.
    pub fn cancel_active(&self) -> bool {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner).take();
        match active {
            Some((id, cancel)) => {
                debug!(request_id = %id, "Cancelling active generation");
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Mark a load as in progress. `None` if another load already is.
    pub(crate) fn try_begin_load(&self) -> Option<LoadGuard<'_>> {
        self.loading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| LoadGuard(&self.loading))
    }

    fn clear_active(&self, id: Uuid) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(active.as_ref(), Some((current, _)) if *current == id) {
            *active = None;
        }
    }
}

/// Clears the loading flag when the load finishes.
pub(crate) struct LoadGuard<'a>(&'a AtomicBool);

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Front-end bookkeeping for one generation: transcript entry, active
/// handle, metrics.
///
/// Dropped before [`ActiveGeneration::finish`] (a client that went away
/// mid-stream) it records the exchange as cancelled.
pub(crate) struct ActiveGeneration<E: NativeEngine> {
    app: Arc<AppState<E>>,
    pub(crate) id: Uuid,
    index: usize,
    started: Instant,
    pub(crate) text: String,
    tokens: usize,
    error: Option<SessionError>,
    finished: bool,
}

impl<E: NativeEngine> ActiveGeneration<E> {
    /// Queue a generation and register it as the active one.
    pub(crate) fn start(app: &Arc<AppState<E>>, prompt: &str, max_tokens: u32) -> (Self, TokenStream) {
        let id = Uuid::new_v4();
        let cancel = CancelHandle::new();
        let previous = app
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace((id, cancel.clone()));
        if let Some((previous, _)) = previous {
            debug!(request_id = %id, previous = %previous, "Generation queued behind another");
        }

        let index = app.transcript().begin(prompt);
        let tokens = app.session.generate_with(prompt, max_tokens, cancel);

        let run = Self {
            app: Arc::clone(app),
            id,
            index,
            started: Instant::now(),
            text: String::new(),
            tokens: 0,
            error: None,
            finished: false,
        };
        (run, tokens)
    }

    pub(crate) fn push(&mut self, piece: &str) {
        self.text.push_str(piece);
        self.tokens += 1;
    }

    pub(crate) fn fail(&mut self, err: SessionError) {
        self.error = Some(err);
    }

    /// Only meaningful after [`ActiveGeneration::finish`].
    pub(crate) fn take_error(&mut self) -> Option<SessionError> {
        self.error.take()
    }

    /// Record the outcome. `summary` is `None` only if the lane went away.
    pub(crate) fn finish(&mut self, summary: Option<&GenerationSummary>) {
        self.finished = true;
        {
            let mut transcript = self.app.transcript();
            match (&self.error, summary) {
                (Some(err), _) => transcript.fail(self.index, err),
                (None, Some(summary)) => transcript.complete(self.index, &self.text, summary),
                (None, None) => transcript.fail(self.index, &SessionError::LaneClosed),
            }
        }
        if let Some(summary) = summary {
            self.app
                .metrics
                .record_generation(summary, self.started.elapsed().as_secs_f64());
        }
        self.app.clear_active(self.id);
    }
}

impl<E: NativeEngine> Drop for ActiveGeneration<E> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        debug!(request_id = %self.id, "Client went away mid-generation");
        self.error = Some(SessionError::Cancelled);
        let summary = GenerationSummary {
            finish_reason: FinishReason::Cancelled,
            prompt_tokens: 0,
            completion_tokens: self.tokens,
        };
        self.finish(Some(&summary));
    }
}

/// Build the axum router with all API routes.
pub fn build_router<E: NativeEngine>(state: Arc<AppState<E>>) -> Router {
    Router::new()
        .route("/v1/models", get(api::list_models::<E>))
        .route("/v1/models/load", post(api::load_model::<E>))
        .route("/v1/models/unload", post(api::unload_model::<E>))
        .route("/v1/completions", post(api::completions::<E>))
        .route("/v1/completions/cancel", post(api::cancel::<E>))
        .route("/v1/bench", post(api::bench::<E>))
        .route(
            "/v1/transcript",
            get(api::get_transcript::<E>).delete(api::clear_transcript::<E>),
        )
        .route("/health", get(api::health::<E>))
        .route("/metrics", get(api::metrics::<E>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
