use bytes::Bytes;
use image::{Rgb, RgbImage};
use std::time::Instant;
use yolo_inference::{Detection, LabelSet};

use crate::{
    font::{draw_text, text_height, text_width},
    frame::{Frame, FrameSizeError, PixelFormat},
};

const LINE_WIDTH: u32 = 2;
const LABEL_PADDING: u32 = 2;

/// Overlay shown in the top-left corner of published frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hud {
    pub sequence: u64,
    pub fps: f32,
    pub detections: usize,
}

pub struct Annotator {
    labels: LabelSet,
    text_scale: u32,
}

impl Annotator {
    pub fn new(labels: LabelSet) -> Self {
        Self {
            labels,
            text_scale: 2,
        }
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    /// Draw boxes and labels onto a copy of `frame`. The output is RGB and
    /// keeps the input's sequence number and capture time.
    pub fn annotate(&self, frame: &Frame, detections: &[Detection]) -> Result<Frame, FrameSizeError> {
        self.render(frame, detections, None)
    }

    pub fn annotate_with_hud(
        &self,
        frame: &Frame,
        detections: &[Detection],
        hud: &Hud,
    ) -> Result<Frame, FrameSizeError> {
        self.render(frame, detections, Some(hud))
    }

    fn render(
        &self,
        frame: &Frame,
        detections: &[Detection],
        hud: Option<&Hud>,
    ) -> Result<Frame, FrameSizeError> {
        if detections.is_empty() && hud.is_none() && frame.format() == PixelFormat::Rgb8 {
            return Ok(frame.clone());
        }

        let Some(mut image) = RgbImage::from_raw(frame.width(), frame.height(), frame.to_rgb()) else {
            let expected = frame.width() as usize * frame.height() as usize * 3;
            return Err(FrameSizeError {
                width: frame.width(),
                height: frame.height(),
                expected,
                actual: frame.data().len(),
            });
        };

        for detection in detections {
            self.draw_detection(&mut image, detection);
        }
        if let Some(hud) = hud {
            self.draw_hud(&mut image, hud);
        }

        frame.derive(PixelFormat::Rgb8, Bytes::from(image.into_raw()))
    }

    fn draw_detection(&self, image: &mut RgbImage, detection: &Detection) {
        let color = self.labels.color(detection.class_id);
        let bbox = &detection.bbox;
        let x1 = bbox.x1.floor() as i64;
        let y1 = bbox.y1.floor() as i64;
        let x2 = bbox.x2.ceil() as i64 - 1;
        let y2 = bbox.y2.ceil() as i64 - 1;
        draw_rect_outline(image, x1, y1, x2, y2, color, LINE_WIDTH);

        let label = format!(
            "{} {:.2}",
            self.labels.name(detection.class_id),
            detection.confidence
        );
        let label_w = text_width(&label, self.text_scale) + 2 * LABEL_PADDING;
        let label_h = text_height(self.text_scale) + 2 * LABEL_PADDING;
        // Above the box when it fits, otherwise just inside its top edge.
        let label_y = if y1 >= label_h as i64 { y1 - label_h as i64 } else { y1.max(0) };
        fill_rect(
            image,
            x1,
            label_y,
            x1 + label_w as i64 - 1,
            label_y + label_h as i64 - 1,
            color,
        );
        draw_text(
            image,
            x1 + LABEL_PADDING as i64,
            label_y + LABEL_PADDING as i64,
            &label,
            contrast(color),
            self.text_scale,
        );
    }

    fn draw_hud(&self, image: &mut RgbImage, hud: &Hud) {
        let text = format!(
            "#{} {:.1} FPS {} OBJ",
            hud.sequence, hud.fps, hud.detections
        );
        let w = text_width(&text, self.text_scale) + 2 * LABEL_PADDING;
        let h = text_height(self.text_scale) + 2 * LABEL_PADDING;
        fill_rect(image, 0, 0, w as i64 - 1, h as i64 - 1, [0, 0, 0]);
        draw_text(
            image,
            LABEL_PADDING as i64,
            LABEL_PADDING as i64,
            &text,
            [255, 255, 255],
            self.text_scale,
        );
    }
}

/// Black or white, whichever reads better on `color`.
fn contrast(color: [u8; 3]) -> [u8; 3] {
    let luma = 0.299 * color[0] as f32 + 0.587 * color[1] as f32 + 0.114 * color[2] as f32;
    if luma > 140. {
        [0, 0, 0]
    } else {
        [255, 255, 255]
    }
}

fn fill_rect(image: &mut RgbImage, x1: i64, y1: i64, x2: i64, y2: i64, color: [u8; 3]) {
    let (width, height) = (image.width() as i64, image.height() as i64);
    let (x1, x2) = (x1.max(0), x2.min(width - 1));
    let (y1, y2) = (y1.max(0), y2.min(height - 1));
    if x1 > x2 || y1 > y2 {
        return;
    }
    for y in y1..=y2 {
        for x in x1..=x2 {
            image.put_pixel(x as u32, y as u32, Rgb(color));
        }
    }
}

fn draw_rect_outline(
    image: &mut RgbImage,
    x1: i64,
    y1: i64,
    x2: i64,
    y2: i64,
    color: [u8; 3],
    thickness: u32,
) {
    if x1 > x2 || y1 > y2 {
        return;
    }
    let t = thickness as i64 - 1;
    fill_rect(image, x1, y1, x2, (y1 + t).min(y2), color);
    fill_rect(image, x1, (y2 - t).max(y1), x2, y2, color);
    fill_rect(image, x1, y1, (x1 + t).min(x2), y2, color);
    fill_rect(image, (x2 - t).max(x1), y1, x2, y2, color);
}

/// Exponentially smoothed frames-per-second.
pub struct FpsMeter {
    last: Option<Instant>,
    fps: f32,
    alpha: f32,
}

impl Default for FpsMeter {
    fn default() -> Self {
        Self {
            last: None,
            fps: 0.,
            alpha: 0.1,
        }
    }
}

impl FpsMeter {
    pub fn tick(&mut self, now: Instant) -> f32 {
        if let Some(last) = self.last {
            let elapsed = now.duration_since(last).as_secs_f32();
            if elapsed > 0. {
                let instant = 1. / elapsed;
                self.fps = if self.fps == 0. {
                    instant
                } else {
                    self.alpha * instant + (1. - self.alpha) * self.fps
                };
            }
        }
        self.last = Some(now);
        self.fps
    }
}
