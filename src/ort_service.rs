use crate::{
    config::ModelConfig,
    detection::RawDetection,
    model_service::{Detector, DetectorError},
};
use image::{imageops::FilterType, RgbImage};
use ndarray::{Array, ArrayD, ArrayViewD, Axis, Ix2, Ix4};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

const OUTPUT_NAME: &str = "output0";

/// Resizes to the square network input and lays the pixels out as a
/// normalized NCHW tensor.
fn transform_image(image: &RgbImage, input_size: u32) -> Array<f32, Ix4> {
    let resized = image::imageops::resize(image, input_size, input_size, FilterType::CatmullRom);

    let size = input_size as usize;
    let mut input = Array::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let x = x as usize;
        let y = y as usize;
        let [r, g, b] = pixel.0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    input
}

/// Decodes a YOLOv8 head of shape `[1, 4 + classes, anchors]` into boxes in
/// original image pixels. Anchors below `min_confidence` are dropped.
fn decode_output(
    output: ArrayViewD<f32>,
    input_size: u32,
    img_width: u32,
    img_height: u32,
    min_confidence: f32,
) -> Result<Vec<RawDetection>, DetectorError> {
    let shape = output.shape().to_vec();
    if shape.len() != 3 || shape[0] != 1 || shape[1] <= 4 {
        return Err(DetectorError::OutputShape(shape));
    }

    let scale_x = img_width as f32 / input_size as f32;
    let scale_y = img_height as f32 / input_size as f32;

    let predictions = output.index_axis(Axis(0), 0).into_dimensionality::<Ix2>()?;
    let mut boxes = Vec::new();

    for anchor in predictions.axis_iter(Axis(1)) {
        let Some((class_id, confidence)) = anchor
            .iter()
            .skip(4)
            .copied()
            .enumerate()
            .reduce(|best, candidate| if candidate.1 > best.1 { candidate } else { best })
        else {
            continue;
        };

        if confidence < min_confidence {
            continue;
        }

        let xc = anchor[0] * scale_x;
        let yc = anchor[1] * scale_y;
        let w = anchor[2] * scale_x;
        let h = anchor[3] * scale_y;

        let raw = RawDetection {
            class_id,
            confidence,
            x1: xc - w / 2.,
            y1: yc - h / 2.,
            x2: xc + w / 2.,
            y2: yc + h / 2.,
        };
        boxes.push(raw.clamped(img_width, img_height));
    }

    Ok(boxes)
}

/// Greedy per-class suppression, highest confidence first.
fn non_max_suppression(mut boxes: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    boxes.sort_by(|box1, box2| box2.confidence.total_cmp(&box1.confidence));

    let mut kept: Vec<RawDetection> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        let suppressed = kept.iter().any(|keeper| {
            keeper.class_id == candidate.class_id && keeper.iou(&candidate) >= iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }

    kept
}

pub struct OrtDetector {
    sessions: Arc<Vec<Arc<Mutex<Session>>>>,
    counter: Arc<AtomicUsize>,
    input_size: u32,
    iou_threshold: f32,
}

impl OrtDetector {
    pub fn new(model_config: &ModelConfig) -> Result<Self, Box<dyn std::error::Error>> {
        #[cfg(feature = "tensorrt")]
        {
            use ort::execution_providers::TensorRTExecutionProvider;
            ort::init()
                .with_execution_providers([TensorRTExecutionProvider::default()
                    .with_engine_cache(true)
                    .build()])
                .commit()?;
        }

        let num_instances = model_config.num_instances.max(1);
        let sessions = (0..num_instances)
            .map(|_| {
                let session = Session::builder()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .commit_from_file(model_config.get_path())?;
                Ok(Arc::new(Mutex::new(session)))
            })
            .collect::<Result<Vec<_>, ort::Error>>()?;

        tracing::info!(
            "Created {} ONNX sessions from {:?}",
            num_instances,
            model_config.get_path()
        );

        Ok(Self {
            sessions: Arc::new(sessions),
            counter: Arc::new(AtomicUsize::new(0)),
            input_size: model_config.input_size,
            iou_threshold: model_config.iou_threshold,
        })
    }

    fn run_inference(&self, input: &Array<f32, Ix4>) -> Result<ArrayD<f32>, DetectorError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let mut session = self.sessions[index]
            .lock()
            .map_err(|_| DetectorError::Poisoned)?;

        tracing::debug!("Handling request with session {}", index);
        let tensor_ref = TensorRef::from_array_view(input.view())?;
        let outputs = session.run(ort::inputs![tensor_ref])?;

        let (shape, data) = outputs[OUTPUT_NAME].try_extract_tensor::<f32>()?;
        let array = ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec())?;

        Ok(array)
    }
}

impl Detector for OrtDetector {
    fn detect(
        &self,
        image: &RgbImage,
        min_confidence: f32,
    ) -> Result<Vec<RawDetection>, DetectorError> {
        let input = transform_image(image, self.input_size);
        let output = self.run_inference(&input)?;

        let boxes = decode_output(
            output.view(),
            self.input_size,
            image.width(),
            image.height(),
            min_confidence,
        )?;

        Ok(non_max_suppression(boxes, self.iou_threshold))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use ndarray::Array3;

    // Builds a head with 2 classes: rows are [xc, yc, w, h, class0, class1].
    fn head(anchors: &[[f32; 6]]) -> ArrayD<f32> {
        let mut output = Array3::<f32>::zeros((1, 6, anchors.len()));
        for (i, anchor) in anchors.iter().enumerate() {
            for (row, value) in anchor.iter().enumerate() {
                output[[0, row, i]] = *value;
            }
        }
        output.into_dyn()
    }

    #[test]
    fn test_transform_image() {
        let img = RgbImage::from_pixel(100, 50, Rgb([255, 0, 0]));

        let input = transform_image(&img, 64);

        assert_eq!(input.shape(), &[1, 3, 64, 64]);
        assert!((input[[0, 0, 10, 10]] - 1.0).abs() < 1e-6);
        assert_eq!(input[[0, 1, 10, 10]], 0.0);
        assert_eq!(input[[0, 2, 63, 63]], 0.0);
    }

    #[test]
    fn test_decode_output_rescales_and_thresholds() {
        let output = head(&[
            [320.0, 320.0, 64.0, 128.0, 0.9, 0.1],
            [100.0, 100.0, 10.0, 10.0, 0.2, 0.4],
        ]);

        let boxes = decode_output(output.view(), 640, 1280, 320, 0.5).unwrap();

        assert_eq!(boxes.len(), 1);
        let b = boxes[0];
        assert_eq!(b.class_id, 0);
        assert!((b.confidence - 0.9).abs() < 1e-6);
        assert_eq!((b.x1, b.x2), (576.0, 704.0));
        assert_eq!((b.y1, b.y2), (128.0, 192.0));
    }

    #[test]
    fn test_decode_output_picks_best_class_and_clamps() {
        let output = head(&[[5.0, 5.0, 20.0, 20.0, 0.3, 0.8]]);

        let boxes = decode_output(output.view(), 640, 640, 640, 0.5).unwrap();

        assert_eq!(boxes[0].class_id, 1);
        assert_eq!((boxes[0].x1, boxes[0].y1), (0.0, 0.0));
        assert_eq!((boxes[0].x2, boxes[0].y2), (15.0, 15.0));
    }

    #[test]
    fn test_decode_output_rejects_bad_shape() {
        let output = Array3::<f32>::zeros((1, 4, 10)).into_dyn();
        assert!(matches!(
            decode_output(output.view(), 640, 640, 640, 0.5),
            Err(DetectorError::OutputShape(_))
        ));
    }

    #[test]
    fn test_nms_is_per_class() {
        let person = RawDetection {
            class_id: 0,
            confidence: 0.8,
            x1: 0.0,
            y1: 0.0,
            x2: 100.0,
            y2: 100.0,
        };
        let duplicate = RawDetection {
            confidence: 0.6,
            x1: 2.0,
            ..person
        };
        let car = RawDetection {
            class_id: 2,
            confidence: 0.9,
            ..person
        };

        let kept = non_max_suppression(vec![duplicate, person, car], 0.7);

        assert_eq!(kept, vec![car, person]);
    }
}
