use crate::{
    artifacts::ArtifactStore,
    config::{Config, Validatable},
    model_service::Detector,
    ort_service::OrtDetector,
    pipeline::DetectionPipeline,
    retention::RetentionSweeper,
    server::{HttpServer, SharedState},
    telemetry::Metrics,
};
use std::{error::Error, sync::Arc};
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    if let Err(e) = config.model.validate() {
        tracing::error!("Configuration validation failed: {}", e);
        return Err(e.into());
    }

    // Loaded once; every request shares this handle until the process exits.
    let detector: Arc<dyn Detector> = match OrtDetector::new(&config.model) {
        Ok(detector) => Arc::new(detector),
        Err(e) => {
            tracing::error!("Failed to initialize detection model: {:?}", e);
            return Err(e);
        }
    };

    let store = Arc::new(ArtifactStore::new(&config.artifacts.output_dir)?);
    let pipeline = Arc::new(DetectionPipeline::new(
        detector,
        store.clone(),
        config.detection.clone(),
    )?);
    let metrics = Arc::new(Metrics::new()?);

    let state = SharedState::new(pipeline, metrics);
    let server = HttpServer::new(state, &config.server).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_shutdown_rx = shutdown_tx.subscribe();
    let sweeper_shutdown_rx = shutdown_tx.subscribe();

    let sweeper_handle = RetentionSweeper::new(store, config.artifacts.retention.clone())
        .start(sweeper_shutdown_rx);
    let server_handle = server.run(server_shutdown_rx).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    if let Some(handle) = sweeper_handle {
        let _ = handle.await;
    }
    server_handle.await??;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
