//! FFI bindings to the llama shim library.
//!
//! The shim is a small C wrapper over llama.cpp that exposes resources as
//! opaque 64-bit handles (heap pointers on the C side). build.rs links it
//! when the `native` feature is enabled.
//!
//! Token pieces come back as raw bytes: a multi-byte character can be split
//! across two sampled tokens, so pieces are buffered here until they form
//! valid UTF-8.

use std::cell::RefCell;
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::path::Path;

use tracing::{debug, error, info, warn};

use super::{BenchParams, ContextParams, DecodeStep, EngineError, Handle, NativeEngine};

const STEP_END_OF_SEQUENCE: c_int = 0;
const STEP_LIMIT_REACHED: c_int = -1;

type LogCallback = extern "C" fn(level: c_int, text: *const c_char, user_data: *mut c_void);

extern "C" {
    fn ls_backend_init() -> c_int;
    fn ls_backend_free();
    fn ls_log_set(callback: LogCallback, user_data: *mut c_void);
    fn ls_system_info() -> *const c_char;

    fn ls_load_model(path: *const c_char) -> u64;
    fn ls_free_model(model: u64);
    fn ls_new_context(model: u64, seed: u32, n_ctx: u32, n_threads: u32) -> u64;
    fn ls_free_context(context: u64);
    fn ls_new_batch(n_tokens: c_int, embd: c_int, n_seq_max: c_int) -> u64;
    fn ls_free_batch(batch: u64);

    fn ls_completion_init(context: u64, batch: u64, text: *const c_char, n_len: c_int) -> c_int;

    /// Writes the next piece into `buf`. Returns the piece length,
    /// `STEP_END_OF_SEQUENCE` on an end-of-generation token,
    /// `STEP_LIMIT_REACHED` once `n_cur >= n_len`, or another negative value
    /// if `llama_decode` failed.
    fn ls_completion_step(
        context: u64,
        batch: u64,
        n_len: c_int,
        n_cur: c_int,
        buf: *mut c_char,
        buf_len: usize,
    ) -> c_int;

    fn ls_kv_cache_clear(context: u64) -> c_int;

    /// Writes a markdown report into `buf`. Returns its length or a negative
    /// value on failure.
    fn ls_bench(
        context: u64,
        model: u64,
        batch: u64,
        pp: c_int,
        tg: c_int,
        pl: c_int,
        nr: c_int,
        buf: *mut c_char,
        buf_len: usize,
    ) -> c_int;
}

const PIECE_BUF_LEN: usize = 256;
const BENCH_BUF_LEN: usize = 8192;

// ggml_log_level values.
const LOG_LEVEL_ERROR: c_int = 2;
const LOG_LEVEL_WARN: c_int = 3;
const LOG_LEVEL_INFO: c_int = 4;

extern "C" fn forward_log(level: c_int, text: *const c_char, _user_data: *mut c_void) {
    if text.is_null() {
        return;
    }
    // SAFETY: llama.cpp passes a NUL-terminated string valid for the call.
    let line = unsafe { CStr::from_ptr(text) }.to_string_lossy();
    let line = line.trim_end();
    if line.is_empty() {
        return;
    }
    match level {
        LOG_LEVEL_ERROR => error!(target: "llama", "{line}"),
        LOG_LEVEL_WARN => warn!(target: "llama", "{line}"),
        LOG_LEVEL_INFO => info!(target: "llama", "{line}"),
        _ => debug!(target: "llama", "{line}"),
    }
}

fn to_c_int(value: u32, what: &str) -> Result<c_int, EngineError> {
    c_int::try_from(value).map_err(|_| EngineError::InvalidArgument(format!("{what} out of range")))
}

/// Handle to the linked shim library.
#[derive(Debug, Default)]
pub struct NativeLibrary {
    /// Bytes of a partially received UTF-8 character.
    pending: RefCell<Vec<u8>>,
}

impl NativeLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw piece and return whatever is now printable.
    fn take_printable(&self, piece: &[u8]) -> String {
        let mut pending = self.pending.borrow_mut();
        pending.extend_from_slice(piece);
        match std::str::from_utf8(&pending) {
            Ok(text) => {
                let text = text.to_string();
                pending.clear();
                text
            }
            // Incomplete trailing sequence: wait for the next piece.
            Err(e) if e.error_len().is_none() => String::new(),
            Err(_) => {
                let text = String::from_utf8_lossy(&pending).into_owned();
                pending.clear();
                text
            }
        }
    }
}

impl NativeEngine for NativeLibrary {
    fn install_log_sink(&self) {
        // SAFETY: `forward_log` is a plain function valid for the process lifetime.
        unsafe { ls_log_set(forward_log, std::ptr::null_mut()) };
    }

    fn init_backend(&self) -> Result<(), EngineError> {
        // SAFETY: no arguments; the shim guards against double init.
        let rc = unsafe { ls_backend_init() };
        if rc != 0 {
            return Err(EngineError::BackendInit(format!("ls_backend_init returned {rc}")));
        }
        Ok(())
    }

    fn shutdown_backend(&self) {
        // SAFETY: only called once, after every handle has been freed.
        unsafe { ls_backend_free() };
    }

    fn engine_info(&self) -> String {
        // SAFETY: returns a pointer to a static buffer inside llama.cpp.
        let info = unsafe { ls_system_info() };
        if info.is_null() {
            return String::new();
        }
        // SAFETY: non-null and NUL-terminated.
        unsafe { CStr::from_ptr(info) }.to_string_lossy().into_owned()
    }

    fn load_model(&self, path: &Path) -> u64 {
        let Some(c_path) = path.to_str().and_then(|p| CString::new(p).ok()) else {
            warn!(path = %path.display(), "Model path is not a valid C string");
            return 0;
        };
        info!(path = %path.display(), "Loading model");
        // SAFETY: `c_path` outlives the call.
        unsafe { ls_load_model(c_path.as_ptr()) }
    }

    fn free_model(&self, model: Handle) {
        // SAFETY: the session frees each model handle exactly once.
        unsafe { ls_free_model(model.raw()) }
    }

    fn new_context(&self, model: Handle, params: &ContextParams) -> u64 {
        info!(threads = params.threads, n_ctx = params.context_size, "Creating context");
        // SAFETY: `model` is a live handle owned by the session.
        unsafe { ls_new_context(model.raw(), params.seed, params.context_size, params.threads) }
    }

    fn free_context(&self, context: Handle) {
        // SAFETY: the session frees each context exactly once, before its model.
        unsafe { ls_free_context(context.raw()) }
    }

    fn new_batch(&self, capacity: u32, embedding_dim: u32, max_sequences: u32) -> u64 {
        let (Ok(n_tokens), Ok(embd), Ok(n_seq_max)) = (
            to_c_int(capacity, "capacity"),
            to_c_int(embedding_dim, "embedding_dim"),
            to_c_int(max_sequences, "max_sequences"),
        ) else {
            return 0;
        };
        // SAFETY: plain value arguments.
        unsafe { ls_new_batch(n_tokens, embd, n_seq_max) }
    }

    fn free_batch(&self, batch: Handle) {
        // SAFETY: the session frees each batch exactly once.
        unsafe { ls_free_batch(batch.raw()) }
    }

    fn prime_completion(&self, context: Handle, batch: Handle, prompt: &str, max_len: i32) -> i32 {
        self.pending.borrow_mut().clear();
        let Ok(text) = CString::new(prompt) else {
            warn!("Prompt contains an interior NUL byte");
            return -1;
        };
        // SAFETY: handles are live; `text` outlives the call.
        unsafe { ls_completion_init(context.raw(), batch.raw(), text.as_ptr(), max_len) }
    }

    fn decode_step(
        &self,
        context: Handle,
        batch: Handle,
        max_len: i32,
        cursor: i32,
    ) -> Result<DecodeStep, EngineError> {
        let mut buf = [0u8; PIECE_BUF_LEN];
        // SAFETY: `buf` is valid for `PIECE_BUF_LEN` bytes for the duration of the call.
        let rc = unsafe {
            ls_completion_step(
                context.raw(),
                batch.raw(),
                max_len,
                cursor,
                buf.as_mut_ptr().cast::<c_char>(),
                buf.len(),
            )
        };
        match rc {
            STEP_END_OF_SEQUENCE => Ok(DecodeStep::EndOfSequence),
            STEP_LIMIT_REACHED => Ok(DecodeStep::LimitReached),
            n if n < 0 => Err(EngineError::DecodeFailed(format!(
                "llama_decode() failed at position {cursor} ({n})"
            ))),
            n => {
                let len = (n as usize).min(buf.len());
                Ok(DecodeStep::Piece(self.take_printable(&buf[..len])))
            }
        }
    }

    fn clear_kv_cache(&self, context: Handle) -> Result<(), EngineError> {
        // SAFETY: `context` is live.
        let rc = unsafe { ls_kv_cache_clear(context.raw()) };
        if rc != 0 {
            return Err(EngineError::CacheClearFailed(format!("ls_kv_cache_clear returned {rc}")));
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
        let pp = to_c_int(params.prompt_len, "prompt_len")?;
        let tg = to_c_int(params.gen_len, "gen_len")?;
        let pl = to_c_int(params.parallel, "parallel")?;
        let nr = to_c_int(params.repetitions, "repetitions")?;

        let mut buf = vec![0u8; BENCH_BUF_LEN];
        // SAFETY: handles are live; `buf` is valid for `BENCH_BUF_LEN` bytes.
        let rc = unsafe {
            ls_bench(
                context.raw(),
                model.raw(),
                batch.raw(),
                pp,
                tg,
                pl,
                nr,
                buf.as_mut_ptr().cast::<c_char>(),
                buf.len(),
            )
        };
        if rc < 0 {
            return Err(EngineError::BenchmarkFailed(format!("ls_bench returned {rc}")));
        }
        buf.truncate((rc as usize).min(BENCH_BUF_LEN));
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}
