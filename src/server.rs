use crate::{
    artifacts::ArtifactStore, config::ServerConfig, pipeline::DetectionPipeline,
    routes::api_routes, telemetry::Metrics,
};
use axum::{extract::DefaultBodyLimit, Router};
use std::sync::Arc;
use tokio::{net::TcpListener, sync::broadcast::Receiver, task::JoinHandle};

#[derive(Clone)]
pub struct SharedState {
    pub pipeline: Arc<DetectionPipeline>,
    pub store: Arc<ArtifactStore>,
    pub metrics: Arc<Metrics>,
}

impl SharedState {
    pub fn new(pipeline: Arc<DetectionPipeline>, metrics: Arc<Metrics>) -> Self {
        Self {
            store: pipeline.store().clone(),
            pipeline,
            metrics,
        }
    }
}

pub fn build_router(state: SharedState, max_upload_bytes: usize) -> Router {
    Router::new()
        .merge(api_routes())
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(state: SharedState, config: &ServerConfig) -> anyhow::Result<Self> {
        let addr = config.get_address();
        let router = build_router(state, config.max_upload_bytes);
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(
        self,
        mut shutdown_rx: Receiver<()>,
    ) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        let listener = self.listener;
        let router = self.router;
        let server_handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await.ok();
                })
                .await?;
            Ok(())
        });

        Ok(server_handle)
    }
}
