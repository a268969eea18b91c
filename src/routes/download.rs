use crate::{error::ApiError, server::SharedState};
use axum::{
    body::Body,
    extract::{Path, State},
    http::header,
    response::Response,
};
use tracing::instrument;

fn content_type_for(filename: &str) -> &'static str {
    match filename.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()) {
        Some(ext) if ext == "jpg" || ext == "jpeg" => "image/jpeg",
        Some(ext) if ext == "json" => "application/json",
        _ => "application/octet-stream",
    }
}

/// Serves a persisted artifact as an attachment. The `filetype` segment is
/// informational only; the file is looked up by name.
#[instrument(skip(state))]
pub async fn download(
    State(state): State<SharedState>,
    Path((filetype, filename)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    state.metrics.record_request("/download");

    let bytes = state.store.fetch(&filename).await?;
    tracing::debug!("Serving {} ({} bytes)", filename, bytes.len());

    Response::builder()
        .header(header::CONTENT_TYPE, content_type_for(&filename))
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", filename),
        )
        .body(Body::from(bytes))
        .map_err(|e| ApiError::Internal(format!("HTTP builder failed: {}", e)))
}
