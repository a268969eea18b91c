use crate::detection::BoundingBox;
use ab_glyph::{Font, FontRef, InvalidFont, PxScale, ScaleFont};
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_hollow_rect_mut, draw_text_mut},
    rect::Rect,
};

const FONT_DATA: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");
const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const STROKE_WIDTH: i32 = 2;
const LABEL_FONT_SIZE: f32 = 16.0;
const LABEL_OFFSET: i32 = 5;

/// Draws detection boxes and their labels in place.
#[derive(Debug, Clone)]
pub struct Annotator {
    font: FontRef<'static>,
    scale: PxScale,
    color: Rgb<u8>,
}

impl Annotator {
    pub fn new() -> Result<Self, InvalidFont> {
        Ok(Self {
            font: FontRef::try_from_slice(FONT_DATA)?,
            scale: PxScale::from(LABEL_FONT_SIZE),
            color: BOX_COLOR,
        })
    }

    /// `"Person 0.87"` for class label `person`.
    pub fn label_text(class_label: &str, confidence: f32) -> String {
        let mut chars = class_label.chars();
        let name = match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
            None => String::new(),
        };
        format!("{} {:.2}", name, confidence)
    }

    pub fn draw_detection(&self, image: &mut RgbImage, bbox: &BoundingBox, label: &str) {
        self.draw_box(image, bbox);

        // draw_text_mut places the baseline one ascent below `y`.
        let ascent = self.font.as_scaled(self.scale).ascent().round() as i32;
        let top = bbox.y1() - LABEL_OFFSET - ascent;
        draw_text_mut(image, self.color, bbox.x1(), top, self.scale, &self.font, label);
    }

    fn draw_box(&self, image: &mut RgbImage, bbox: &BoundingBox) {
        for inset in 0..STROKE_WIDTH {
            let width = bbox.width() as i32 + 1 - 2 * inset;
            let height = bbox.height() as i32 + 1 - 2 * inset;
            if width <= 0 || height <= 0 {
                break;
            }
            let rect = Rect::at(bbox.x1() + inset, bbox.y1() + inset)
                .of_size(width as u32, height as u32);
            draw_hollow_rect_mut(image, rect, self.color);
        }
    }
}
