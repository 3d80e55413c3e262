//! Runtime configuration for llm-session.
//!
//! Configuration is loaded from a JSON file; every field has a default, so a
//! partial file (or none at all) is fine. CLI flags override the file.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::engine::{BenchParams, ContextParams};
use crate::session::SessionConfig;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "llm-session", about = "Native LLM inference session server")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address. Overrides `server.listen`.
    #[arg(long)]
    pub listen: Option<String>,

    /// Model to load at startup. Overrides `model.path`.
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub json_logs: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,

    /// Lane-level settings handed to the session manager.
    pub session: SessionConfig,

    /// Model loaded at startup, if any.
    pub model: ModelConfig,

    pub generation: GenerationConfig,

    /// Default benchmark shape for `POST /v1/bench`.
    pub benchmark: BenchParams,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "127.0.0.1:8080").
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Path to the GGUF model file.
    pub path: Option<PathBuf>,

    /// Overrides `session.context` for the startup load.
    pub context: Option<ContextParams>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Used when a completion request does not set `max_tokens`.
    pub max_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self { max_tokens: 32 }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Apply CLI overrides on top of the file.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(listen) = &cli.listen {
            self.server.listen = listen.clone();
        }
        if let Some(model) = &cli.model {
            self.model.path = Some(model.clone());
        }
    }

    /// Context parameters for the startup load.
    pub fn startup_context(&self) -> ContextParams {
        self.model
            .context
            .clone()
            .unwrap_or_else(|| self.session.context.clone())
    }
}
