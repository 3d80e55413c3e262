//! Native inference engine boundary.
//!
//! Everything behind [`NativeEngine`] is opaque to this crate: tokenization,
//! sampling and the transformer itself live in the native library. The
//! session layer only ever sees integer [`Handle`]s and token strings.
//!
//! - [`simulated`]: in-process engine used when the native library is not linked
//! - [`ffi`]: `extern "C"` binding to the llama shim library (feature `native`)

#[cfg(feature = "native")]
pub mod ffi;
pub mod simulated;

use std::fmt;
use std::num::NonZeroU64;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine used by the binary: the native library when linked, otherwise the
/// simulated one.
#[cfg(feature = "native")]
pub type DefaultEngine = ffi::NativeLibrary;
#[cfg(not(feature = "native"))]
pub type DefaultEngine = simulated::SimulatedEngine;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Backend initialization failed: {0}")]
    BackendInit(String),

    #[error("Decode failed: {0}")]
    DecodeFailed(String),

    #[error("KV cache clear failed: {0}")]
    CacheClearFailed(String),

    #[error("Benchmark failed: {0}")]
    BenchmarkFailed(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// A live native resource. The null handle (zero) is not representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(NonZeroU64);

impl Handle {
    /// Convert a raw value returned by the engine; zero means "no resource".
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn raw(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Context creation parameters (mirrors the subset of llama_context_params
/// the session exposes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextParams {
    /// RNG seed for sampling.
    pub seed: u32,

    /// Context size in tokens.
    pub context_size: u32,

    /// Threads used for generation and batch processing.
    pub threads: u32,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            seed: 42,
            context_size: 512,
            threads: 4,
        }
    }
}

/// Benchmark shape: prompt processing length, generation length, parallel
/// sequences and repetitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchParams {
    pub prompt_len: u32,
    pub gen_len: u32,
    pub parallel: u32,
    pub repetitions: u32,
}

impl Default for BenchParams {
    fn default() -> Self {
        Self {
            prompt_len: 512,
            gen_len: 128,
            parallel: 1,
            repetitions: 3,
        }
    }
}

/// Outcome of one [`NativeEngine::decode_step`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeStep {
    /// A sampled piece. Empty while the engine holds back an incomplete
    /// UTF-8 sequence.
    Piece(String),

    /// The model sampled an end-of-generation token.
    EndOfSequence,

    /// `cursor` reached `max_len` before the model stopped on its own.
    LimitReached,
}

/// The synchronous native interface.
///
/// Implementations are not required to be thread-safe: the session moves the
/// engine onto its lane thread and never calls it from anywhere else. Methods
/// returning `u64` return zero when the native side failed to create the
/// resource.
pub trait NativeEngine: Send + 'static {
    /// Route the engine's own log output somewhere useful. Called before
    /// every [`NativeEngine::init_backend`] attempt, so it must be idempotent.
    fn install_log_sink(&self) {}

    fn init_backend(&self) -> Result<(), EngineError>;

    fn shutdown_backend(&self);

    /// Human-readable description of the compiled backend features.
    fn engine_info(&self) -> String;

    fn load_model(&self, path: &Path) -> u64;

    fn free_model(&self, model: Handle);

    fn new_context(&self, model: Handle, params: &ContextParams) -> u64;

    fn free_context(&self, context: Handle);

    fn new_batch(&self, capacity: u32, embedding_dim: u32, max_sequences: u32) -> u64;

    fn free_batch(&self, batch: Handle);

    /// Tokenize and decode `prompt` into `batch`. Returns the number of
    /// prompt tokens consumed, or a negative value on failure.
    fn prime_completion(&self, context: Handle, batch: Handle, prompt: &str, max_len: i32) -> i32;

    /// Sample one token at position `cursor` and feed it back for the next
    /// step. End-of-sequence takes precedence over the length limit.
    fn decode_step(
        &self,
        context: Handle,
        batch: Handle,
        max_len: i32,
        cursor: i32,
    ) -> Result<DecodeStep, EngineError>;

    fn clear_kv_cache(&self, context: Handle) -> Result<(), EngineError>;

    fn run_benchmark(
        &self,
        context: Handle,
        model: Handle,
        batch: Handle,
        params: &BenchParams,
    ) -> Result<String, EngineError>;
}
