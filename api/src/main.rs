use std::sync::Arc;

use anyhow::{Context, Result};
use sentinel_core::audit::JsonlAuditSink;
use sentinel_core::config::AppConfig;
use sentinel_sdk::Engine;
use sentinel_api::{build_router, AppState};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    sentinel_core::init_tracing();

    let config = AppConfig::load().context("loading configuration")?;
    let dead_letters = JsonlAuditSink::open(&config.jobs.dead_letter_path)
        .with_context(|| format!("opening {}", config.jobs.dead_letter_path))?;

    let engine = Engine::builder(config.clone())
        .dead_letter_sink(Arc::new(dead_letters))
        .checkpoint_dir(&config.jobs.checkpoint_dir)
        .build()?;
    let engine = Arc::new(engine);
    let handle = Arc::clone(&engine).start()?;

    let app = build_router(Arc::new(AppState { engine }));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Sentinel API starting on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    info!("draining ingestion before exit");
    handle.shutdown().await;
    Ok(())
}
