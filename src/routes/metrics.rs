use crate::{error::ApiError, server::SharedState};
use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Response},
};

pub async fn metrics_handler(State(state): State<SharedState>) -> Result<Response, ApiError> {
    state.metrics.record_request("/metrics");

    let body = state
        .metrics
        .render()
        .map_err(|e| ApiError::Internal(format!("failed to encode metrics: {}", e)))?;

    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response())
}
