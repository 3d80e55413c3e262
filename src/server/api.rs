//! HTTP API.
//!
//! - POST /v1/models/load, POST /v1/models/unload, GET /v1/models
//! - POST /v1/completions (JSON, or SSE with `"stream": true`)
//! - POST /v1/completions/cancel
//! - POST /v1/bench
//! - GET/DELETE /v1/transcript
//! - GET /health, GET /metrics

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::engine::{BenchParams, ContextParams, NativeEngine};
use crate::server::streaming::completion_sse_stream;
use crate::server::transcript::Exchange;
use crate::server::{ActiveGeneration, AppState};
use crate::session::{FinishReason, SessionError};

// ─── Errors ────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Session(SessionError::NoModelLoaded) => StatusCode::CONFLICT,
            ApiError::Session(SessionError::ModelLoad { .. } | SessionError::ContextCreate { .. }) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ApiError::Session(SessionError::PromptEncode { .. }) => StatusCode::BAD_REQUEST,
            ApiError::Session(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::Session(SessionError::NoModelLoaded) => "no_model_loaded",
            ApiError::Session(SessionError::ModelLoad { .. }) => "model_load_error",
            ApiError::Session(SessionError::ContextCreate { .. }) => "context_create_error",
            ApiError::Session(SessionError::PromptEncode { .. }) => "prompt_encode_error",
            ApiError::Session(_) | ApiError::Internal(_) => "internal_error",
            ApiError::BadRequest(_) => "invalid_request",
            ApiError::Conflict(_) => "conflict",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, "Request failed");
        }
        let body = ErrorResponse {
            error: ErrorBody {
                message: self.to_string(),
                kind: self.kind(),
            },
        };
        (status, Json(body)).into_response()
    }
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct LoadRequest {
    pub path: PathBuf,
    /// Falls back to the configured context parameters.
    #[serde(default)]
    pub context: Option<ContextParams>,
}

#[derive(Debug, Serialize)]
pub struct LoadResponse {
    pub model: String,
    pub status: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Serialize)]
pub struct CompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
}

#[derive(Debug, Serialize)]
pub struct CompletionChoice {
    pub index: usize,
    pub text: String,
    pub finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// Every field falls back to the configured benchmark shape.
#[derive(Debug, Default, Deserialize)]
pub struct BenchRequest {
    pub prompt_len: Option<u32>,
    pub gen_len: Option<u32>,
    pub parallel: Option<u32>,
    pub repetitions: Option<u32>,
}

impl BenchRequest {
    fn resolve(&self, defaults: &BenchParams) -> BenchParams {
        BenchParams {
            prompt_len: self.prompt_len.unwrap_or(defaults.prompt_len),
            gen_len: self.gen_len.unwrap_or(defaults.gen_len),
            parallel: self.parallel.unwrap_or(defaults.parallel),
            repetitions: self.repetitions.unwrap_or(defaults.repetitions),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BenchResponse {
    pub params: BenchParams,
    pub report: String,
}

#[derive(Debug, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelInfo>,
}

#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: &'static str,
    pub owned_by: &'static str,
}

#[derive(Debug, Serialize)]
pub struct TranscriptResponse {
    pub exchanges: Vec<Exchange>,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub model: Option<String>,
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub(crate) fn model_name(path: Option<&PathBuf>) -> String {
    path.and_then(|p| p.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

// ─── Route Handlers ────────────────────────────────────────────────────────

pub async fn load_model<E: NativeEngine>(
    State(state): State<Arc<AppState<E>>>,
    Json(req): Json<LoadRequest>,
) -> Result<Json<LoadResponse>, ApiError> {
    let Some(_loading) = state.try_begin_load() else {
        state.transcript().log("Model is already loading. Please wait.");
        return Err(ApiError::Conflict("Model is already loading".into()));
    };

    // A load queued behind a running stream would wait for it to finish.
    state.cancel_active();

    let params = req
        .context
        .unwrap_or_else(|| state.config.session.context.clone());
    info!(path = %req.path.display(), "Load request");

    match state.session.load_with(&req.path, params).await {
        Ok(()) => {
            state.metrics.record_load(true);
            state.transcript().log(format!("Loaded {}", req.path.display()));
            Ok(Json(LoadResponse {
                model: req.path.display().to_string(),
                status: "loaded",
            }))
        }
        Err(e) => {
            state.metrics.record_load(false);
            state.transcript().log(e.to_string());
            Err(e.into())
        }
    }
}

pub async fn unload_model<E: NativeEngine>(
    State(state): State<Arc<AppState<E>>>,
) -> Result<StatusCode, ApiError> {
    state.cancel_active();
    state.session.unload().await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_models<E: NativeEngine>(
    State(state): State<Arc<AppState<E>>>,
) -> Result<Json<ModelList>, ApiError> {
    let loaded = state.session.loaded_model().await?;
    Ok(Json(ModelList {
        object: "list",
        data: loaded
            .map(|path| ModelInfo {
                id: path.display().to_string(),
                object: "model",
                owned_by: "local",
            })
            .into_iter()
            .collect(),
    }))
}

pub async fn completions<E: NativeEngine>(
    State(state): State<Arc<AppState<E>>>,
    Json(req): Json<CompletionRequest>,
) -> Result<Response, ApiError> {
    let prompt = req.prompt.trim();
    if prompt.is_empty() {
        return Err(ApiError::BadRequest("prompt must not be empty".into()));
    }
    let max_tokens = req
        .max_tokens
        .unwrap_or(state.config.generation.max_tokens);
    let model = model_name(state.session.loaded_model().await?.as_ref());

    let (mut run, mut tokens) = ActiveGeneration::start(&state, prompt, max_tokens);
    info!(
        request_id = %run.id,
        max_tokens,
        stream = req.stream,
        "Completion request"
    );

    if req.stream {
        let stream = completion_sse_stream(run, tokens, model);
        return Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response());
    }

    while let Some(item) = tokens.next().await {
        match item {
            Ok(piece) => run.push(&piece),
            Err(err) => run.fail(err),
        }
    }
    let summary = tokens.summary().cloned();
    run.finish(summary.as_ref());

    let finish_reason = match run.take_error() {
        // Cancelled mid-stream: the partial text is still the answer.
        Some(SessionError::Cancelled) => FinishReason::Cancelled,
        Some(err) => return Err(err.into()),
        None => summary
            .as_ref()
            .map(|s| s.finish_reason)
            .ok_or(SessionError::LaneClosed)?,
    };

    let (prompt_tokens, completion_tokens) = summary
        .as_ref()
        .map(|s| (s.prompt_tokens, s.completion_tokens))
        .unwrap_or_default();

    Ok(Json(CompletionResponse {
        id: format!("cmpl-{}", run.id),
        object: "text_completion",
        created: unix_now(),
        model,
        choices: vec![CompletionChoice {
            index: 0,
            text: std::mem::take(&mut run.text),
            finish_reason: finish_reason.as_str(),
        }],
        usage: Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        },
    })
    .into_response())
}

pub async fn cancel<E: NativeEngine>(State(state): State<Arc<AppState<E>>>) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: state.cancel_active(),
    })
}

pub async fn bench<E: NativeEngine>(
    State(state): State<Arc<AppState<E>>>,
    Json(req): Json<BenchRequest>,
) -> Result<Json<BenchResponse>, ApiError> {
    let params = req.resolve(&state.config.benchmark);
    let report = state.session.benchmark(params.clone()).await?;
    state.metrics.record_benchmark();
    Ok(Json(BenchResponse { params, report }))
}

pub async fn get_transcript<E: NativeEngine>(
    State(state): State<Arc<AppState<E>>>,
) -> Json<TranscriptResponse> {
    let transcript = state.transcript();
    Json(TranscriptResponse {
        exchanges: transcript.exchanges().to_vec(),
        text: transcript.export(),
    })
}

pub async fn clear_transcript<E: NativeEngine>(State(state): State<Arc<AppState<E>>>) -> StatusCode {
    state.transcript().clear();
    StatusCode::NO_CONTENT
}

pub async fn health<E: NativeEngine>(
    State(state): State<Arc<AppState<E>>>,
) -> Result<Json<HealthResponse>, ApiError> {
    let model = state.session.loaded_model().await?;
    Ok(Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        model: model.map(|p| p.display().to_string()),
    }))
}

pub async fn metrics<E: NativeEngine>(
    State(state): State<Arc<AppState<E>>>,
) -> Result<Response, ApiError> {
    let body = state
        .metrics
        .render()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}
