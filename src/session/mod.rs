//! Native inference session manager.
//!
//! - [`lane`]: the single thread all native calls are confined to
//! - [`state`]: owned handles and the loaded/unloaded state machine
//! - [`generation`]: the streaming generation protocol
//!
//! [`SessionManager`] is the public face: a cheap-to-clone handle that routes
//! every operation onto the lane. Operations are queued when the method is
//! called and run strictly in that order, so a `load` issued while a stream
//! is running waits for that stream to finish. Cancel the stream first to
//! preempt it.

pub mod generation;
pub mod lane;
pub(crate) mod state;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

use crate::engine::{BenchParams, ContextParams, EngineError, NativeEngine};
use generation::{EventSink, GenerationRequest};
use lane::Lane;
use state::BatchHandle;

pub use generation::{CancelHandle, FinishReason, GenerationSummary, TokenStream};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to load model from {}", path.display())]
    ModelLoad { path: PathBuf },

    #[error("Failed to create context for model {}", path.display())]
    ContextCreate { path: PathBuf },

    #[error("No model loaded")]
    NoModelLoaded,

    #[error("Failed to allocate a batch of {capacity} tokens")]
    BatchAlloc { capacity: u32 },

    #[error("Prompt priming returned invalid cursor {cursor} (limit {limit})")]
    PromptEncode { cursor: i32, limit: i32 },

    #[error("Generation cancelled")]
    Cancelled,

    #[error("Decode step failed: {0}")]
    Decode(#[source] EngineError),

    #[error("Native engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Operation panicked on the session lane: {0}")]
    Panicked(String),

    #[error("Session lane is not running")]
    LaneClosed,

    #[error("Failed to spawn session lane thread")]
    LaneSpawn(#[source] std::io::Error),
}

/// Session tuning that is not per-call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Token capacity of the scratch batch allocated per generation.
    pub batch_capacity: u32,

    /// Context parameters used by [`SessionManager::load`].
    pub context: ContextParams,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            batch_capacity: 512,
            context: ContextParams::default(),
        }
    }
}

/// Handle to the session. Clones share one lane and one loaded model.
///
/// When the last clone is dropped the lane finishes queued work, frees the
/// loaded model, shuts the backend down and its thread is joined.
pub struct SessionManager<E: NativeEngine> {
    lane: Arc<Lane<E>>,
    config: Arc<SessionConfig>,
}

impl<E: NativeEngine> Clone for SessionManager<E> {
    fn clone(&self) -> Self {
        Self {
            lane: Arc::clone(&self.lane),
            config: Arc::clone(&self.config),
        }
    }
}

impl<E: NativeEngine> SessionManager<E> {
    /// Move `engine` onto a new lane thread. The backend itself is
    /// initialized lazily by the first operation that needs it.
    pub fn new(engine: E, config: SessionConfig) -> Result<Self, SessionError> {
        Ok(Self {
            lane: Arc::new(Lane::spawn(engine)?),
            config: Arc::new(config),
        })
    }

    /// Load the model at `path` with the configured context parameters,
    /// releasing any model already loaded.
    pub fn load(&self, path: &Path) -> impl Future<Output = Result<(), SessionError>> + Send + 'static {
        self.load_with(path, self.config.context.clone())
    }

    pub fn load_with(
        &self,
        path: &Path,
        params: ContextParams,
    ) -> impl Future<Output = Result<(), SessionError>> + Send + 'static {
        let path = path.to_path_buf();
        self.lane.submit(move |core| {
            core.ensure_backend()?;
            core.state.load(&core.engine, &path, &params)
        })
    }

    /// Release the loaded model. A no-op when nothing is loaded.
    pub fn unload(&self) -> impl Future<Output = Result<(), SessionError>> + Send + 'static {
        self.lane.submit(|core| {
            if !core.state.unload() {
                info!("unload() called with no model loaded");
            }
            Ok(())
        })
    }

    /// Stream up to `max_tokens` pieces completing `prompt`.
    ///
    /// `max_tokens` bounds the cursor, which starts at the prompt length, so
    /// it covers prompt plus completion. With nothing loaded the stream is
    /// empty and its summary reports [`FinishReason::NotLoaded`].
    pub fn generate(&self, prompt: impl Into<String>, max_tokens: u32) -> TokenStream {
        self.generate_with(prompt, max_tokens, CancelHandle::new())
    }

    /// Like [`SessionManager::generate`], with a caller-supplied cancel
    /// handle that is live before the generation is even queued.
    pub fn generate_with(
        &self,
        prompt: impl Into<String>,
        max_tokens: u32,
        cancel: CancelHandle,
    ) -> TokenStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let request = GenerationRequest {
            prompt: prompt.into(),
            max_tokens: i32::try_from(max_tokens).unwrap_or(i32::MAX),
            batch_capacity: self.config.batch_capacity,
        };

        let sink = EventSink::new(tx.clone(), cancel.clone());
        let queued = self
            .lane
            .dispatch(move |core| generation::run(&core.engine, &core.state, &request, &sink));
        if let Err(err) = queued {
            EventSink::new(tx, cancel.clone()).fail(err);
        }

        TokenStream::new(rx, cancel)
    }

    /// Run the engine's benchmark against the loaded model.
    pub fn benchmark(
        &self,
        params: BenchParams,
    ) -> impl Future<Output = Result<String, SessionError>> + Send + 'static {
        let capacity = self.config.batch_capacity;
        self.lane.submit(move |core| {
            let loaded = core.state.loaded().ok_or(SessionError::NoModelLoaded)?;
            let batch = BatchHandle::allocate(&core.engine, capacity)?;
            info!(
                pp = params.prompt_len,
                tg = params.gen_len,
                pl = params.parallel,
                nr = params.repetitions,
                "Running benchmark"
            );
            let report =
                core.engine
                    .run_benchmark(loaded.context(), loaded.model(), batch.handle(), &params)?;
            drop(batch);
            Ok(report)
        })
    }

    /// The engine's system info string. Initializes the backend if needed.
    pub fn engine_info(&self) -> impl Future<Output = Result<String, SessionError>> + Send + 'static {
        self.lane.submit(|core| {
            core.ensure_backend()?;
            Ok(core.engine.engine_info())
        })
    }

    /// Path of the loaded model, if any.
    pub fn loaded_model(
        &self,
    ) -> impl Future<Output = Result<Option<PathBuf>, SessionError>> + Send + 'static {
        self.lane
            .submit(|core| Ok(core.state.loaded().map(|loaded| loaded.path().to_path_buf())))
    }
}
