use crate::detection::RawDetection;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("ONNX Runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[error("invalid tensor shape: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("unexpected model output shape {0:?}")]
    OutputShape(Vec<usize>),
    #[error("session mutex poisoned")]
    Poisoned,
}

/// The object-detection capability. Implementations are shared by every
/// request handler and must be safe to call concurrently.
pub trait Detector: Send + Sync + 'static {
    /// Returns every detection scoring at least `min_confidence`, in
    /// pixel coordinates of `image`.
    fn detect(
        &self,
        image: &RgbImage,
        min_confidence: f32,
    ) -> Result<Vec<RawDetection>, DetectorError>;
}
