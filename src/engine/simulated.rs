//! Simulated engine.
//!
//! Stands in for llama.cpp when the native library is not linked, so the
//! session manager and the HTTP front-end can run anywhere. It keeps the same
//! handle discipline as the real engine (null on failure, live handles in
//! internal tables) but the "model" just echoes the prompt back word by word.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, warn};

use super::{BenchParams, ContextParams, DecodeStep, EngineError, Handle, NativeEngine};

/// Simulated model table entry.
#[derive(Debug)]
struct SimModel {
    path: PathBuf,
    file_size: u64,
}

/// Simulated context table entry.
#[derive(Debug)]
struct SimContext {
    /// Model this context was created from.
    model: u64,

    /// Context size in tokens.
    n_ctx: u32,

    /// Tokens currently held in the KV cache.
    kv_used: usize,

    /// Pieces left to produce for the current completion.
    pending: VecDeque<String>,
}

/// In-process engine with the same handle semantics as the native one.
///
/// Interior mutability is `Cell`/`RefCell`: the session only calls the engine
/// from its lane thread.
#[derive(Debug, Default)]
pub struct SimulatedEngine {
    next_handle: Cell<u64>,
    backend_ready: Cell<bool>,
    models: RefCell<HashMap<u64, SimModel>>,
    contexts: RefCell<HashMap<u64, SimContext>>,
    batches: RefCell<HashSet<u64>>,
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&self) -> u64 {
        let handle = self.next_handle.get() + 1;
        self.next_handle.set(handle);
        handle
    }

    /// Number of live native resources (models + contexts + batches).
    pub fn live_resources(&self) -> usize {
        self.models.borrow().len() + self.contexts.borrow().len() + self.batches.borrow().len()
    }
}

/// Split a prompt into the pieces the simulated model will emit.
fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .enumerate()
        .map(|(i, word)| {
            if i == 0 {
                word.to_string()
            } else {
                format!(" {word}")
            }
        })
        .collect()
}

impl NativeEngine for SimulatedEngine {
    fn init_backend(&self) -> Result<(), EngineError> {
        self.backend_ready.set(true);
        Ok(())
    }

    fn shutdown_backend(&self) {
        self.backend_ready.set(false);
    }

    fn engine_info(&self) -> String {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        format!("SIMULATED = 1 | THREADS = {threads} | AVX = 0 | NEON = 0 | METAL = 0 | ")
    }

    fn load_model(&self, path: &Path) -> u64 {
        let file_size = match std::fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!(path = %path.display(), "load_model() failed: {e}");
                return 0;
            }
        };

        let handle = self.allocate();
        self.models.borrow_mut().insert(
            handle,
            SimModel {
                path: path.to_path_buf(),
                file_size,
            },
        );
        debug!(handle, path = %path.display(), "Simulated model loaded");
        handle
    }

    fn free_model(&self, model: Handle) {
        self.models.borrow_mut().remove(&model.raw());
    }

    fn new_context(&self, model: Handle, params: &ContextParams) -> u64 {
        if !self.models.borrow().contains_key(&model.raw()) || params.context_size == 0 {
            return 0;
        }

        let handle = self.allocate();
        self.contexts.borrow_mut().insert(
            handle,
            SimContext {
                model: model.raw(),
                n_ctx: params.context_size,
                kv_used: 0,
                pending: VecDeque::new(),
            },
        );
        handle
    }

    fn free_context(&self, context: Handle) {
        self.contexts.borrow_mut().remove(&context.raw());
    }

    fn new_batch(&self, capacity: u32, _embedding_dim: u32, max_sequences: u32) -> u64 {
        if capacity == 0 || max_sequences == 0 {
            return 0;
        }
        let handle = self.allocate();
        self.batches.borrow_mut().insert(handle);
        handle
    }

    fn free_batch(&self, batch: Handle) {
        self.batches.borrow_mut().remove(&batch.raw());
    }

    fn prime_completion(&self, context: Handle, batch: Handle, prompt: &str, max_len: i32) -> i32 {
        if !self.batches.borrow().contains(&batch.raw()) {
            return -1;
        }
        let mut contexts = self.contexts.borrow_mut();
        let Some(ctx) = contexts.get_mut(&context.raw()) else {
            return -1;
        };

        let pieces = tokenize(prompt);
        let n_kv_req = pieces.len().max(max_len.max(0) as usize);
        if n_kv_req > ctx.n_ctx as usize {
            warn!(
                n_kv_req,
                n_ctx = ctx.n_ctx,
                "The required KV cache size is not big enough"
            );
        }

        ctx.kv_used = pieces.len();
        ctx.pending = pieces.into();
        ctx.kv_used as i32
    }

    fn decode_step(
        &self,
        context: Handle,
        _batch: Handle,
        max_len: i32,
        cursor: i32,
    ) -> Result<DecodeStep, EngineError> {
        let mut contexts = self.contexts.borrow_mut();
        let ctx = contexts
            .get_mut(&context.raw())
            .ok_or_else(|| EngineError::DecodeFailed(format!("unknown context {context}")))?;

        if ctx.pending.is_empty() {
            return Ok(DecodeStep::EndOfSequence);
        }
        if cursor >= max_len {
            return Ok(DecodeStep::LimitReached);
        }
        if ctx.kv_used >= ctx.n_ctx as usize {
            return Err(EngineError::DecodeFailed("context window exhausted".into()));
        }

        match ctx.pending.pop_front() {
            Some(piece) => {
                ctx.kv_used += 1;
                Ok(DecodeStep::Piece(piece))
            }
            None => Ok(DecodeStep::EndOfSequence),
        }
    }

    fn clear_kv_cache(&self, context: Handle) -> Result<(), EngineError> {
        let mut contexts = self.contexts.borrow_mut();
        let ctx = contexts
            .get_mut(&context.raw())
            .ok_or_else(|| EngineError::CacheClearFailed(format!("unknown context {context}")))?;
        ctx.kv_used = 0;
        ctx.pending.clear();
        Ok(())
    }

    fn run_benchmark(
        &self,
        context: Handle,
        model: Handle,
        batch: Handle,
        params: &BenchParams,
    ) -> Result<String, EngineError> {
        let models = self.models.borrow();
        let sim_model = models
            .get(&model.raw())
            .ok_or_else(|| EngineError::BenchmarkFailed(format!("unknown model {model}")))?;
        let contexts = self.contexts.borrow();
        match contexts.get(&context.raw()) {
            Some(ctx) if ctx.model == model.raw() => {}
            _ => {
                return Err(EngineError::BenchmarkFailed(format!(
                    "context {context} does not belong to model {model}"
                )))
            }
        }
        if !self.batches.borrow().contains(&batch.raw()) {
            return Err(EngineError::BenchmarkFailed(format!("unknown batch {batch}")));
        }
        if params.repetitions == 0 {
            return Err(EngineError::InvalidArgument("repetitions must be > 0".into()));
        }

        let mut pp_rates = Vec::with_capacity(params.repetitions as usize);
        let mut tg_rates = Vec::with_capacity(params.repetitions as usize);
        for _ in 0..params.repetitions {
            pp_rates.push(simulated_rate(params.prompt_len * params.parallel));
            tg_rates.push(simulated_rate(params.gen_len * params.parallel));
        }
        let (pp_avg, pp_std) = mean_std(&pp_rates);
        let (tg_avg, tg_std) = mean_std(&tg_rates);

        let name = sim_model
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".to_string());
        let size_gib = sim_model.file_size as f64 / 1024.0 / 1024.0 / 1024.0;

        let mut report = String::new();
        report.push_str("| model | size | backend | test | t/s |\n");
        report.push_str("| --- | --- | --- | --- | --- |\n");
        report.push_str(&format!(
            "| {name} | {size_gib:.2} GiB | simulated | pp {} | {pp_avg:.2} ± {pp_std:.2} |\n",
            params.prompt_len
        ));
        report.push_str(&format!(
            "| {name} | {size_gib:.2} GiB | simulated | tg {} | {tg_avg:.2} ± {tg_std:.2} |\n",
            params.gen_len
        ));
        Ok(report)
    }
}

/// Time a trivial per-token loop and report tokens/second.
fn simulated_rate(tokens: u32) -> f64 {
    let start = Instant::now();
    let mut acc = 0u64;
    for t in 0..tokens {
        acc = acc.wrapping_mul(31).wrapping_add(u64::from(t));
    }
    std::hint::black_box(acc);
    let secs = start.elapsed().as_secs_f64().max(1e-6);
    f64::from(tokens) / secs
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if values.len() < 2 {
        return (mean, 0.0);
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, var.sqrt())
}
