//! Recording mock engine shared by the integration tests.

#![allow(dead_code)]

use std::cell::Cell;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use llm_session::engine::{
    BenchParams, ContextParams, DecodeStep, EngineError, Handle, NativeEngine,
};
use llm_session::session::CancelHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    InstallLogSink,
    InitBackend,
    ShutdownBackend,
    EngineInfo,
    LoadModel(PathBuf),
    FreeModel(u64),
    NewContext(u64),
    FreeContext(u64),
    NewBatch(u32),
    FreeBatch(u64),
    Prime { context: u64, batch: u64, max_len: i32 },
    Decode { cursor: i32 },
    ClearKv(u64),
    Bench { context: u64, model: u64, batch: u64 },
}

impl Call {
    pub fn is_native_resource(&self) -> bool {
        !matches!(
            self,
            Call::InstallLogSink | Call::InitBackend | Call::ShutdownBackend | Call::EngineInfo
        )
    }
}

/// Every call the engine saw, with the name of the thread it arrived on.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<(Call, String)>>>);

impl CallLog {
    fn record(&self, call: Call) {
        let thread = std::thread::current()
            .name()
            .unwrap_or("<unnamed>")
            .to_string();
        self.0.lock().unwrap().push((call, thread));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
    }

    pub fn threads(&self) -> Vec<String> {
        self.0.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }

    /// Calls touching native resources (setup/teardown/info filtered out).
    pub fn resource_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(Call::is_native_resource)
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    pub fn position(&self, call: &Call) -> Option<usize> {
        self.calls().iter().position(|c| c == call)
    }

    pub fn decode_cursors(&self) -> Vec<i32> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Decode { cursor } => Some(cursor),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

/// Knobs for the mock's behavior.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Paths for which `load_model` returns the null handle.
    pub null_models: HashSet<PathBuf>,
    /// Path whose load panics.
    pub panic_on_load: Option<PathBuf>,
    pub null_context: bool,
    pub null_batch: bool,
    /// Value returned by `prime_completion`; defaults to 1.
    pub prime_cursor: Option<i32>,
    /// Pieces returned by successive decode steps, then end of sequence.
    pub tokens: Vec<String>,
    /// 0-based decode step that fails.
    pub fail_decode_at: Option<usize>,
    /// 0-based decode step that panics.
    pub panic_decode_at: Option<usize>,
    /// Cancel this handle right after the n-th decode step (1-based).
    pub cancel_after: Option<(usize, CancelHandle)>,
    pub decode_delay: Option<Duration>,
    pub fail_cache_clear: bool,
    pub fail_benchmark: bool,
    /// Number of `init_backend` calls that fail before one succeeds.
    pub init_failures: usize,
}

impl Script {
    pub fn with_tokens(tokens: &[&str]) -> Self {
        Self {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            ..Self::default()
        }
    }
}

pub struct RecordingEngine {
    script: Script,
    log: CallLog,
    next_model: Cell<u64>,
    next_context: Cell<u64>,
    next_batch: Cell<u64>,
    step: Cell<usize>,
    init_attempts: Cell<usize>,
}

impl RecordingEngine {
    pub fn new(script: Script) -> (Self, CallLog) {
        let log = CallLog::default();
        let engine = Self {
            script,
            log: log.clone(),
            next_model: Cell::new(0),
            next_context: Cell::new(0),
            next_batch: Cell::new(0),
            step: Cell::new(0),
            init_attempts: Cell::new(0),
        };
        (engine, log)
    }

    fn bump(counter: &Cell<u64>) -> u64 {
        counter.set(counter.get() + 1);
        counter.get()
    }
}

pub fn tokens(pieces: usize) -> Vec<String> {
    (0..pieces).map(|i| format!("t{i}")).collect()
}

impl NativeEngine for RecordingEngine {
    fn install_log_sink(&self) {
        self.log.record(Call::InstallLogSink);
    }

    fn init_backend(&self) -> Result<(), EngineError> {
        self.log.record(Call::InitBackend);
        let attempt = self.init_attempts.get();
        self.init_attempts.set(attempt + 1);
        if attempt < self.script.init_failures {
            return Err(EngineError::BackendInit("scripted failure".into()));
        }
        Ok(())
    }

    fn shutdown_backend(&self) {
        self.log.record(Call::ShutdownBackend);
    }

    fn engine_info(&self) -> String {
        self.log.record(Call::EngineInfo);
        "MOCK = 1 | ".to_string()
    }

    fn load_model(&self, path: &Path) -> u64 {
        self.log.record(Call::LoadModel(path.to_path_buf()));
        if self.script.panic_on_load.as_deref() == Some(path) {
            panic!("scripted panic loading {}", path.display());
        }
        if self.script.null_models.contains(path) {
            return 0;
        }
        Self::bump(&self.next_model)
    }

    fn free_model(&self, model: Handle) {
        self.log.record(Call::FreeModel(model.raw()));
    }

    fn new_context(&self, model: Handle, _params: &ContextParams) -> u64 {
        self.log.record(Call::NewContext(model.raw()));
        if self.script.null_context {
            return 0;
        }
        Self::bump(&self.next_context)
    }

    fn free_context(&self, context: Handle) {
        self.log.record(Call::FreeContext(context.raw()));
    }

    fn new_batch(&self, capacity: u32, _embedding_dim: u32, _max_sequences: u32) -> u64 {
        self.log.record(Call::NewBatch(capacity));
        if self.script.null_batch {
            return 0;
        }
        Self::bump(&self.next_batch)
    }

    fn free_batch(&self, batch: Handle) {
        self.log.record(Call::FreeBatch(batch.raw()));
    }

    fn prime_completion(&self, context: Handle, batch: Handle, _prompt: &str, max_len: i32) -> i32 {
        self.log.record(Call::Prime {
            context: context.raw(),
            batch: batch.raw(),
            max_len,
        });
        self.step.set(0);
        self.script.prime_cursor.unwrap_or(1)
    }

    fn decode_step(
        &self,
        _context: Handle,
        _batch: Handle,
        _max_len: i32,
        cursor: i32,
    ) -> Result<DecodeStep, EngineError> {
        self.log.record(Call::Decode { cursor });
        let step = self.step.get();
        self.step.set(step + 1);

        if let Some(delay) = self.script.decode_delay {
            std::thread::sleep(delay);
        }
        if self.script.panic_decode_at == Some(step) {
            panic!("scripted panic at decode step {step}");
        }
        if self.script.fail_decode_at == Some(step) {
            return Err(EngineError::DecodeFailed(format!("scripted failure at step {step}")));
        }
        if let Some((after, cancel)) = &self.script.cancel_after {
            if step + 1 == *after {
                cancel.cancel();
            }
        }
        Ok(match self.script.tokens.get(step) {
            Some(piece) => DecodeStep::Piece(piece.clone()),
            None => DecodeStep::EndOfSequence,
        })
    }

    fn clear_kv_cache(&self, context: Handle) -> Result<(), EngineError> {
        self.log.record(Call::ClearKv(context.raw()));
        if self.script.fail_cache_clear {
            return Err(EngineError::CacheClearFailed("scripted".into()));
        }
        Ok(())
    }

    fn run_benchmark(
        &self,
        context: Handle,
        model: Handle,
        batch: Handle,
        params: &BenchParams,
    ) -> Result<String, EngineError> {
        self.log.record(Call::Bench {
            context: context.raw(),
            model: model.raw(),
            batch: batch.raw(),
        });
        if self.script.fail_benchmark {
            return Err(EngineError::BenchmarkFailed("scripted failure".into()));
        }
        Ok(format!("pp {} | tg {}", params.prompt_len, params.gen_len))
    }
}
