mod detect;
mod download;
mod health;
mod index;
mod metrics;

use crate::server::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/", get(index::index))
        .route("/detect", post(detect::detect))
        .route("/download/{filetype}/{filename}", get(download::download))
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
}
