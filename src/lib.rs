//! llm-session: native LLM inference session manager.
//!
//! Drives a native inference engine through a foreign-function boundary.
//! Every native call is confined to one dedicated thread, and generated
//! tokens are streamed back as a cancellable `futures::Stream`.
//!
//! - [`engine`]: the native boundary and its bindings
//! - [`session`]: lane, state machine and generation protocol
//! - [`server`]: HTTP/SSE front-end over the session API
//! - [`config`]: CLI and file configuration

pub mod config;
pub mod engine;
pub mod server;
pub mod session;

pub use engine::{
    BenchParams, ContextParams, DecodeStep, DefaultEngine, EngineError, Handle, NativeEngine,
};
pub use session::{
    CancelHandle, FinishReason, GenerationSummary, SessionConfig, SessionError, SessionManager,
    TokenStream,
};
