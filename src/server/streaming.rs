//! SSE (Server-Sent Events) streaming for token-by-token responses.
//!
//! Converts a [`TokenStream`] into an SSE stream of completion chunks,
//! followed by a final chunk carrying the finish reason and usage, then the
//! `[DONE]` sentinel.

use std::convert::Infallible;

use axum::response::sse::Event;
use futures::stream::{self, Stream};
use serde::Serialize;
use tokio_stream::StreamExt;

use crate::engine::NativeEngine;
use crate::server::api::{unix_now, Usage};
use crate::server::ActiveGeneration;
use crate::session::{FinishReason, TokenStream};

/// Streaming completion chunk.
#[derive(Debug, Serialize)]
pub struct CompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Serialize)]
pub struct ChunkChoice {
    pub index: usize,
    pub text: String,
    pub finish_reason: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct StreamError {
    message: String,
}

struct SseState<E: NativeEngine> {
    run: ActiveGeneration<E>,
    tokens: TokenStream,
    model: String,
}

impl<E: NativeEngine> SseState<E> {
    fn chunk(&self, text: String, finish_reason: Option<&'static str>, usage: Option<Usage>) -> Event {
        let chunk = CompletionChunk {
            id: format!("cmpl-{}", self.run.id),
            object: "text_completion.chunk",
            created: unix_now(),
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                text,
                finish_reason,
            }],
            usage,
        };
        Event::default().data(serde_json::to_string(&chunk).unwrap_or_default())
    }
}

/// Stream a running generation as SSE events.
///
/// Dropping the returned stream (client disconnect) drops the token stream,
/// which cancels the generation on the lane.
pub(crate) fn completion_sse_stream<E: NativeEngine>(
    run: ActiveGeneration<E>,
    tokens: TokenStream,
    model: String,
) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    let state = SseState { run, tokens, model };

    stream::unfold(Some(state), |state| async move {
        let Some(mut state) = state else {
            return None;
        };
        match state.tokens.next().await {
            Some(Ok(piece)) => {
                state.run.push(&piece);
                let event = state.chunk(piece, None, None);
                Some((Ok::<_, Infallible>(event), Some(state)))
            }
            Some(Err(err)) => {
                let data = serde_json::to_string(&StreamError {
                    message: err.to_string(),
                })
                .unwrap_or_default();
                state.run.fail(err);
                Some((Ok(Event::default().event("error").data(data)), Some(state)))
            }
            None => {
                let summary = state.tokens.summary().cloned();
                state.run.finish(summary.as_ref());

                // Errors and cancellation are already folded into the summary.
                let finish_reason = summary
                    .as_ref()
                    .map(|s| s.finish_reason)
                    .unwrap_or(FinishReason::Failed);
                let usage = summary.as_ref().map(|s| Usage {
                    prompt_tokens: s.prompt_tokens,
                    completion_tokens: s.completion_tokens,
                    total_tokens: s.prompt_tokens + s.completion_tokens,
                });
                let event = state.chunk(String::new(), Some(finish_reason.as_str()), usage);
                Some((Ok(event), None))
            }
        }
    })
    // Append the [DONE] sentinel after all events.
    .chain(tokio_stream::once(Ok(Event::default().data("[DONE]"))))
}
