//! llm-session server binary.
//!
//! Starts the session lane, optionally loads a model, and serves the HTTP
//! front-end.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use llm_session::config::{Cli, Config};
use llm_session::engine::DefaultEngine;
use llm_session::server::{build_router, AppState};
use llm_session::session::SessionManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "llm_session=debug,llama=debug,tower_http=debug"
    } else {
        "llm_session=info,llama=warn,tower_http=info"
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }

    info!("llm-session v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(&cli.config)?;
    config.apply_cli(&cli);
    let config = Arc::new(config);

    info!(
        listen = %config.server.listen,
        batch_capacity = config.session.batch_capacity,
        n_ctx = config.session.context.context_size,
        threads = config.session.context.threads,
        "Configuration loaded"
    );

    let session = SessionManager::new(DefaultEngine::default(), config.session.clone())?;
    info!(engine = %session.engine_info().await?, "Engine ready");

    if let Some(path) = &config.model.path {
        // A bad startup model is not fatal; one can be loaded over HTTP.
        if let Err(e) = session.load_with(path, config.startup_context()).await {
            error!(path = %path.display(), "Startup model load failed: {e}");
        }
    }

    let state = Arc::new(AppState::new(session, config.clone())?);
    let app = build_router(state);

    let listener = TcpListener::bind(&config.server.listen).await?;
    info!("Listening on {}", config.server.listen);

    axum::serve(listener, app).await?;

    Ok(())
}
