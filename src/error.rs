use crate::{artifacts::ArtifactError, pipeline::PipelineError};
use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("No image uploaded")]
    MissingInput,
    #[error("Invalid image: {0}")]
    InvalidImage(String),
    #[error("Invalid filename")]
    InvalidFilename(String),
    #[error("File not found")]
    NotFound(String),
    #[error("Upload failed: {reason}")]
    Upload { status: StatusCode, reason: String },
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingInput | ApiError::InvalidImage(_) | ApiError::InvalidFilename(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Upload { status, .. } => *status,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::InvalidImage(reason) => ApiError::InvalidImage(reason),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        ApiError::Upload {
            status: err.status(),
            reason: err.body_text(),
        }
    }
}

impl From<ArtifactError> for ApiError {
    fn from(err: ArtifactError) -> Self {
        match err {
            ArtifactError::InvalidFilename(name) => ApiError::InvalidFilename(name),
            ArtifactError::NotFound(name) => ApiError::NotFound(name),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            ApiError::Internal(reason) => {
                tracing::error!("Request failed: {}", reason);
                return (status, format!("Something went wrong: {}", reason)).into_response();
            }
            ApiError::InvalidFilename(name) | ApiError::NotFound(name) => {
                tracing::info!("Download of {:?} rejected: {}", name, self);
            }
            ApiError::MissingInput | ApiError::InvalidImage(_) | ApiError::Upload { .. } => {
                tracing::info!("Detection request rejected: {}", self);
            }
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
