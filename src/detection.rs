use serde::{Deserialize, Serialize};

/// A single box as reported by the model, in pixels of the decoded image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    pub class_id: usize,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl RawDetection {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    pub fn intersection(&self, other: &RawDetection) -> f32 {
        let w = self.x2.min(other.x2) - self.x1.max(other.x1);
        let h = self.y2.min(other.y2) - self.y1.max(other.y1);
        w.max(0.0) * h.max(0.0)
    }

    pub fn iou(&self, other: &RawDetection) -> f32 {
        let intersection = self.intersection(other);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            return 0.0;
        }
        intersection / union
    }

    /// Limits the box to `[0, width] x [0, height]`. Non-finite
    /// coordinates collapse to zero and the box is dropped later as
    /// degenerate.
    pub fn clamped(self, width: u32, height: u32) -> Self {
        let clamp = |v: f32, max: u32| {
            if v.is_finite() {
                v.clamp(0.0, max as f32)
            } else {
                0.0
            }
        };
        Self {
            x1: clamp(self.x1, width),
            y1: clamp(self.y1, height),
            x2: clamp(self.x2, width),
            y2: clamp(self.y2, height),
            ..self
        }
    }

    /// Integer pixel box, truncating each coordinate. `None` when the box
    /// collapses to zero width or height.
    pub fn to_bounding_box(&self) -> Option<BoundingBox> {
        BoundingBox::new(
            self.x1 as i32,
            self.y1 as i32,
            self.x2 as i32,
            self.y2 as i32,
        )
    }
}

/// Integer pixel box with `x1 < x2` and `y1 < y2`. Serialized as
/// `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "[i32; 4]", try_from = "[i32; 4]")]
pub struct BoundingBox {
    x1: i32,
    y1: i32,
    x2: i32,
    y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Option<Self> {
        if x1 < x2 && y1 < y2 {
            Some(Self { x1, y1, x2, y2 })
        } else {
            None
        }
    }

    pub fn x1(&self) -> i32 {
        self.x1
    }

    pub fn y1(&self) -> i32 {
        self.y1
    }

    pub fn width(&self) -> u32 {
        (self.x2 - self.x1) as u32
    }

    pub fn height(&self) -> u32 {
        (self.y2 - self.y1) as u32
    }
}

impl From<BoundingBox> for [i32; 4] {
    fn from(bbox: BoundingBox) -> Self {
        [bbox.x1, bbox.y1, bbox.x2, bbox.y2]
    }
}

impl TryFrom<[i32; 4]> for BoundingBox {
    type Error = String;

    fn try_from([x1, y1, x2, y2]: [i32; 4]) -> Result<Self, Self::Error> {
        BoundingBox::new(x1, y1, x2, y2)
            .ok_or_else(|| format!("degenerate bounding box [{x1}, {y1}, {x2}, {y2}]"))
    }
}

/// A retained detection of the target class, as reported to callers and
/// persisted in the JSON record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "class")]
    pub class_label: String,
    pub confidence: f64,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(class_label: &str, raw_confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            class_label: class_label.to_string(),
            confidence: round_confidence(raw_confidence),
            bbox,
        }
    }
}

/// Two-decimal rounding used for reporting only, never for filtering.
pub fn round_confidence(confidence: f32) -> f64 {
    (f64::from(confidence) * 100.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub detections: Vec<Detection>,
}

impl DetectionRecord {
    /// Pretty JSON with four-space indentation.
    pub fn to_pretty_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut serializer)?;
        Ok(buf)
    }
}
