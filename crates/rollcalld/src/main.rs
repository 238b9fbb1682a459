use anyhow::{Context, Result};
use rollcall_core::{DatasetCache, OnnxAnalyzer};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod error;
mod routes;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = config::Config::from_env();
    tracing::info!(
        bind = %config.bind,
        model_dir = %config.model_dir.display(),
        dataset_dir = %config.dataset_dir.display(),
        db_path = %config.db_path.display(),
        threshold = config.distance_threshold,
        "configuration loaded"
    );

    let analyzer = OnnxAnalyzer::load(&config.model_dir)
        .with_context(|| format!("failed to load models from {}", config.model_dir.display()))?;
    let engine = engine::spawn_engine(Box::new(analyzer))?;

    let dataset = Arc::new(DatasetCache::new());
    let faces = engine.load_dataset(config.dataset_dir.clone()).await?;
    let snapshot = dataset.replace(faces);
    tracing::info!(
        identities = snapshot.identity_count(),
        entries = snapshot.faces.len(),
        "initial dataset loaded"
    );

    let bind = config.bind;
    let app = routes::router(routes::AppState {
        engine,
        dataset,
        config: Arc::new(config),
    });

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(addr = %bind, "rollcalld ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
        })
        .await?;

    tracing::info!("rollcalld shutting down");
    Ok(())
}
