//! Flowlane runtime entry point

use anyhow::Result;
use flowlane_common::{metrics, telemetry, Config};
use flowlane_core::store::MemoryStore;
use flowlane_engine::Engine;
use flowlane_saga::{spawn_sweeper, SagaOrchestrator};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    // Validate configuration
    if let Err(errors) = config.validate() {
        for error in errors {
            eprintln!("Config error: {error}");
        }
        std::process::exit(1);
    }

    // Initialize telemetry and metrics
    telemetry::init_telemetry(&config.observability)?;
    metrics::init_metrics()?;

    info!("Starting Flowlane v{}", env!("CARGO_PKG_VERSION"));

    let store = Arc::new(MemoryStore::new());
    let engine = Arc::new(Engine::new(config.clone(), store.clone()));
    engine.start()?;

    // Saga recovery runs before new work is accepted from transports
    let sagas = SagaOrchestrator::new(engine.clone(), store.clone(), config.saga.clone());
    let report = sagas.recover().await?;
    info!(
        resumed = report.resumed,
        compensated = report.compensated,
        skipped = report.skipped,
        "saga recovery finished"
    );

    let shutdown = CancellationToken::new();
    let sweeper = spawn_sweeper(sagas.log().clone(), config.saga.clone(), shutdown.clone());
    let stream_cleanup = Arc::clone(engine.stream()).spawn_cleanup(shutdown.clone());

    info!("Flowlane is ready");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down Flowlane");
    shutdown.cancel();
    engine.stop().await?;
    let _ = sweeper.await;
    let _ = stream_cleanup.await;
    telemetry::shutdown_telemetry();

    Ok(())
}
