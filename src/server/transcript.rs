//! Conversation transcript kept by the front-end.
//!
//! An ordered list of `(user, reply)` exchanges. System notices are stored as
//! exchanges whose user side is `[System]`. Each reply is finalized with a
//! marker describing how its generation ended.

use serde::Serialize;

use crate::session::{FinishReason, GenerationSummary, SessionError};

pub const SYSTEM_SPEAKER: &str = "[System]";
pub const COMPLETED_MARKER: &str = "[Output Completed]";
pub const MAX_TOKENS_MARKER: &str = "[Max Tokens Limit Reached]";
pub const CANCELLED_REPLY: &str = "Operation canceled.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Exchange {
    pub user: String,
    pub reply: String,
}

#[derive(Debug, Default)]
pub struct Transcript {
    exchanges: Vec<Exchange>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a prompt with an empty reply. Returns its index.
    pub fn begin(&mut self, prompt: &str) -> usize {
        self.exchanges.push(Exchange {
            user: prompt.to_string(),
            reply: String::new(),
        });
        self.exchanges.len() - 1
    }

    /// Store the final reply for `index` given how the generation ended.
    pub fn complete(&mut self, index: usize, text: &str, summary: &GenerationSummary) {
        let reply = match summary.finish_reason {
            FinishReason::EndOfSequence | FinishReason::NotLoaded => format!("{text}{COMPLETED_MARKER}"),
            FinishReason::MaxTokens => format!("{text}{MAX_TOKENS_MARKER}"),
            FinishReason::Cancelled => CANCELLED_REPLY.to_string(),
            // The stream's error item carries the detail.
            FinishReason::Failed => "Error: Unknown error".to_string(),
        };
        self.set_reply(index, reply);
    }

    /// Store the reply for a generation that ended with `err`.
    pub fn fail(&mut self, index: usize, err: &SessionError) {
        let reply = match err {
            SessionError::Cancelled => CANCELLED_REPLY.to_string(),
            other => format!("Error: {other}"),
        };
        self.set_reply(index, reply);
    }

    /// Append a system notice.
    pub fn log(&mut self, message: impl Into<String>) {
        self.exchanges.push(Exchange {
            user: SYSTEM_SPEAKER.to_string(),
            reply: message.into(),
        });
    }

    pub fn clear(&mut self) {
        self.exchanges.clear();
    }

    pub fn exchanges(&self) -> &[Exchange] {
        &self.exchanges
    }

    /// Plain-text export, one `User:`/`LLM:` pair per exchange.
    pub fn export(&self) -> String {
        self.exchanges
            .iter()
            .map(|e| format!("User: {}\nLLM: {}", e.user, e.reply))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn set_reply(&mut self, index: usize, reply: String) {
        if let Some(exchange) = self.exchanges.get_mut(index) {
            exchange.reply = reply;
        }
    }
}
