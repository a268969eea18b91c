use crate::{
    annotation::Annotator,
    artifacts::{ArtifactError, ArtifactNames, ArtifactStore},
    config::DetectionConfig,
    detection::{Detection, DetectionRecord, RawDetection},
    model_service::{Detector, DetectorError},
};
use ab_glyph::InvalidFont;
use base64::{prelude::BASE64_STANDARD, Engine};
use image::{codecs::jpeg::JpegEncoder, RgbImage};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid image: {0}")]
    InvalidImage(String),
    #[error("Detection failed: {0}")]
    Detection(#[from] DetectorError),
    #[error("Failed to encode annotated image: {0}")]
    Encode(image::ImageError),
    #[error("Failed to persist artifacts: {0}")]
    Persist(#[from] ArtifactError),
    #[error("Failed to load label font: {0}")]
    Font(#[from] InvalidFont),
}

/// Response payload of one detection request.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionOutcome {
    pub detections: Vec<Detection>,
    #[serde(rename = "image")]
    pub image_base64: String,
    #[serde(flatten)]
    pub artifacts: ArtifactNames,
}

pub struct DetectionPipeline {
    detector: Arc<dyn Detector>,
    store: Arc<ArtifactStore>,
    annotator: Annotator,
    config: DetectionConfig,
}

impl DetectionPipeline {
    pub fn new(
        detector: Arc<dyn Detector>,
        store: Arc<ArtifactStore>,
        config: DetectionConfig,
    ) -> Result<Self, PipelineError> {
        Ok(Self {
            detector,
            store,
            annotator: Annotator::new()?,
            config,
        })
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    /// Decode, detect, keep the target class, annotate, persist, encode.
    /// Runs start to finish on the calling thread.
    #[instrument(skip_all, fields(bytes = image_bytes.len()))]
    pub fn handle(&self, image_bytes: &[u8]) -> Result<DetectionOutcome, PipelineError> {
        let mut image = decode_image(image_bytes)?;

        let raw = self
            .detector
            .detect(&image, self.config.confidence_threshold)?;
        let retained = self.retain_target_class(raw, image.width(), image.height());

        for (detection, raw_confidence) in &retained {
            let label = Annotator::label_text(&self.config.target_class_label, *raw_confidence);
            self.annotator
                .draw_detection(&mut image, &detection.bbox, &label);
        }

        let annotated_jpeg = encode_jpeg(&image, self.config.jpeg_quality)?;
        let record = DetectionRecord {
            detections: retained.into_iter().map(|(detection, _)| detection).collect(),
        };
        let artifacts = self.store.persist(&annotated_jpeg, &record)?;

        tracing::info!(
            "Detected {} {} instance(s), saved as {}",
            record.detections.len(),
            self.config.target_class_label,
            artifacts.image_file
        );

        Ok(DetectionOutcome {
            detections: record.detections,
            image_base64: BASE64_STANDARD.encode(&annotated_jpeg),
            artifacts,
        })
    }

    /// Keeps target-class detections whose raw score clears the threshold
    /// and whose box, clamped to the image, is non-degenerate. The raw score
    /// travels along for the label text.
    fn retain_target_class(
        &self,
        raw: Vec<RawDetection>,
        width: u32,
        height: u32,
    ) -> Vec<(Detection, f32)> {
        raw.into_iter()
            .filter(|d| d.class_id == self.config.target_class_id)
            .filter(|d| d.confidence >= self.config.confidence_threshold && d.confidence <= 1.0)
            .map(|d| d.clamped(width, height))
            .filter_map(|d| match d.to_bounding_box() {
                Some(bbox) => Some((
                    Detection::new(&self.config.target_class_label, d.confidence, bbox),
                    d.confidence,
                )),
                None => {
                    tracing::debug!("Dropping degenerate box {:?}", d);
                    None
                }
            })
            .collect()
    }
}

fn decode_image(bytes: &[u8]) -> Result<RgbImage, PipelineError> {
    let image = image::load_from_memory(bytes)
        .map_err(|e| PipelineError::InvalidImage(e.to_string()))?
        .to_rgb8();
    if image.width() == 0 || image.height() == 0 {
        return Err(PipelineError::InvalidImage("image has no pixels".to_string()));
    }
    Ok(image)
}

fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, PipelineError> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(PipelineError::Encode)?;
    Ok(buffer)
}
