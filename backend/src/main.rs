use anyhow::{Context, Result};
use backend::config::Config;
use backend::{app, AppState};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    let state = match &config.persist_path {
        Some(path) => AppState::with_persistence(path.clone()).await,
        None => AppState::default(),
    };

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "gift exchange server listening");
    axum::serve(listener, app(state))
        .await
        .context("server error")?;
    Ok(())
}
