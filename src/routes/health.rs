use crate::server::SharedState;
use axum::{extract::State, response::Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct Health {
    status: &'static str,
}

/// Liveness only. The detector is loaded before the listener binds, so a
/// serving process is ready to detect.
pub async fn healthcheck(State(state): State<SharedState>) -> Json<Health> {
    state.metrics.record_request("/health");
    Json(Health {
        status: "Available",
    })
}
