use crate::{error::ApiError, pipeline::DetectionOutcome, server::SharedState};
use axum::{
    body::Bytes,
    extract::{multipart::MultipartRejection, Multipart, State},
    response::Json,
};
use std::time::Instant;
use tracing::instrument;

const IMAGE_FIELD: &str = "image";

/// Pulls the `image` field out of the upload. A request that is not
/// multipart at all counts as a missing image.
async fn read_image_field(
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Bytes, ApiError> {
    let mut multipart = multipart.map_err(|rejection| {
        tracing::debug!("Not a multipart upload: {}", rejection);
        ApiError::MissingInput
    })?;

    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some(IMAGE_FIELD) {
            return Ok(field.bytes().await?);
        }
    }

    Err(ApiError::MissingInput)
}

#[instrument(skip(state, multipart))]
pub async fn detect(
    State(state): State<SharedState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<DetectionOutcome>, ApiError> {
    state.metrics.record_request("/detect");

    let image_data = read_image_field(multipart).await?;
    tracing::debug!("Received {} bytes of image data", image_data.len());

    let pipeline = state.pipeline.clone();
    let started = Instant::now();
    let result = tokio::task::spawn_blocking(move || pipeline.handle(&image_data))
        .await
        .map_err(|e| ApiError::Internal(format!("detection task failed: {}", e)))?;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(outcome) => {
            state.metrics.record_detection_duration(elapsed_ms, "ok");
            state.metrics.record_detections(outcome.detections.len());
            Ok(Json(outcome))
        }
        Err(err) => {
            state.metrics.record_detection_duration(elapsed_ms, "error");
            Err(err.into())
        }
    }
}
