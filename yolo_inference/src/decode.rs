//! Turns raw accelerator output into detections.
//!
//! Each model family lays its output tensor out differently, so the layout is
//! chosen at configuration time and handled by an `OutputDecoder`. The
//! `Postprocessor` then applies the same steps to every layout: confidence
//! threshold, class-wise suppression, cap, and the inverse letterbox.

use ndarray::{ArrayViewD, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    letterbox::Letterbox,
    nms::{suppress, BoundingBox, Suppressible},
    tensor::RawTensorOutput,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("{layout} output expects shape {expected}, got {actual:?}")]
    UnexpectedShape {
        layout: &'static str,
        expected: String,
        actual: Vec<usize>,
    },
}

/// Output tensor conventions understood by the postprocessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputLayout {
    /// `[1, 4 + C, N]`: cx, cy, w, h followed by per-class scores.
    #[default]
    Yolov8,
    /// `[1, N, 5 + C]`: cx, cy, w, h, objectness, per-class scores.
    Yolov5,
    /// `[C, K, 5]`: per-class boxes already suppressed on the device, as
    /// normalised ymin, xmin, ymax, xmax, score. Zero score rows are padding.
    ClassNms,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Thresholds {
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
    #[serde(default = "default_max_detections")]
    pub max_detections: usize,
}

fn default_confidence_threshold() -> f32 {
    0.5
}

fn default_iou_threshold() -> f32 {
    0.45
}

fn default_max_detections() -> usize {
    100
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            iou_threshold: default_iou_threshold(),
            max_detections: default_max_detections(),
        }
    }
}

impl Thresholds {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(format!(
                "confidence_threshold must be within [0, 1], got {}",
                self.confidence_threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(format!(
                "iou_threshold must be within [0, 1], got {}",
                self.iou_threshold
            ));
        }
        if self.max_detections == 0 {
            return Err("max_detections must be at least 1".into());
        }
        Ok(())
    }
}

/// Scored box in model input space, before suppression.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub class_id: u32,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Suppressible for Candidate {
    fn class_id(&self) -> u32 {
        self.class_id
    }

    fn confidence(&self) -> f32 {
        self.confidence
    }

    fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }
}

/// A detected object, in pixel coordinates of the frame it was computed on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub class_id: u32,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub sequence: u64,
}

impl Suppressible for Detection {
    fn class_id(&self) -> u32 {
        self.class_id
    }

    fn confidence(&self) -> f32 {
        self.confidence
    }

    fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }
}

pub trait OutputDecoder: Send + Sync {
    /// Candidates at or above `min_confidence`, in tensor order, with boxes in
    /// model input pixels.
    fn candidates(
        &self,
        output: &RawTensorOutput,
        input_size: (u32, u32),
        min_confidence: f32,
    ) -> Result<Vec<Candidate>, DecodeError>;
}

pub fn decoder_for(layout: OutputLayout, num_classes: usize) -> Box<dyn OutputDecoder> {
    match layout {
        OutputLayout::Yolov8 => Box::new(Yolov8Decoder { num_classes }),
        OutputLayout::Yolov5 => Box::new(Yolov5Decoder { num_classes }),
        OutputLayout::ClassNms => Box::new(ClassNmsDecoder { num_classes }),
    }
}

/// Drop a leading batch dimension of one.
fn unbatched<'a>(view: ArrayViewD<'a, f32>, rank: usize) -> ArrayViewD<'a, f32> {
    if view.ndim() == rank + 1 && view.shape()[0] == 1 {
        view.index_axis_move(Axis(0), 0)
    } else {
        view
    }
}

/// Highest class score and its index; ties resolve to the lowest index.
fn best_class(scores: impl Iterator<Item = f32>) -> Option<(u32, f32)> {
    scores
        .enumerate()
        .fold(None, |best, (index, score)| match best {
            Some((_, top)) if top >= score => best,
            _ => Some((index as u32, score)),
        })
}

pub struct Yolov8Decoder {
    num_classes: usize,
}

impl OutputDecoder for Yolov8Decoder {
    fn candidates(
        &self,
        output: &RawTensorOutput,
        _input_size: (u32, u32),
        min_confidence: f32,
    ) -> Result<Vec<Candidate>, DecodeError> {
        let view = unbatched(output.view(), 2);
        let channels = 4 + self.num_classes;
        if view.ndim() != 2 || view.shape()[0] != channels {
            return Err(DecodeError::UnexpectedShape {
                layout: "yolov8",
                expected: format!("[1, {channels}, N]"),
                actual: output.shape().to_vec(),
            });
        }

        let mut candidates = Vec::new();
        for anchor in view.axis_iter(Axis(1)) {
            let Some((class_id, confidence)) = best_class(anchor.iter().skip(4).copied()) else {
                continue;
            };
            if confidence.is_nan() || confidence < min_confidence {
                continue;
            }
            candidates.push(Candidate {
                class_id,
                confidence,
                bbox: BoundingBox::from_center(anchor[0], anchor[1], anchor[2], anchor[3]),
            });
        }
        Ok(candidates)
    }
}

pub struct Yolov5Decoder {
    num_classes: usize,
}

impl OutputDecoder for Yolov5Decoder {
    fn candidates(
        &self,
        output: &RawTensorOutput,
        _input_size: (u32, u32),
        min_confidence: f32,
    ) -> Result<Vec<Candidate>, DecodeError> {
        let view = unbatched(output.view(), 2);
        let channels = 5 + self.num_classes;
        if view.ndim() != 2 || view.shape()[1] != channels {
            return Err(DecodeError::UnexpectedShape {
                layout: "yolov5",
                expected: format!("[1, N, {channels}]"),
                actual: output.shape().to_vec(),
            });
        }

        let mut candidates = Vec::new();
        for row in view.axis_iter(Axis(0)) {
            let objectness = row[4];
            if objectness.is_nan() || objectness < min_confidence {
                continue;
            }
            let Some((class_id, score)) = best_class(row.iter().skip(5).copied()) else {
                continue;
            };
            let confidence = objectness * score;
            if confidence.is_nan() || confidence < min_confidence {
                continue;
            }
            candidates.push(Candidate {
                class_id,
                confidence,
                bbox: BoundingBox::from_center(row[0], row[1], row[2], row[3]),
            });
        }
        Ok(candidates)
    }
}

pub struct ClassNmsDecoder {
    num_classes: usize,
}

impl OutputDecoder for ClassNmsDecoder {
    fn candidates(
        &self,
        output: &RawTensorOutput,
        input_size: (u32, u32),
        min_confidence: f32,
    ) -> Result<Vec<Candidate>, DecodeError> {
        let view = unbatched(output.view(), 3);
        if view.ndim() != 3 || view.shape()[0] != self.num_classes || view.shape()[2] != 5 {
            return Err(DecodeError::UnexpectedShape {
                layout: "class_nms",
                expected: format!("[{}, K, 5]", self.num_classes),
                actual: output.shape().to_vec(),
            });
        }

        let (width, height) = (input_size.0 as f32, input_size.1 as f32);
        let mut candidates = Vec::new();
        for (class_id, boxes) in view.axis_iter(Axis(0)).enumerate() {
            for row in boxes.axis_iter(Axis(0)) {
                let score = row[4];
                if score.is_nan() || score <= 0. || score < min_confidence {
                    continue;
                }
                candidates.push(Candidate {
                    class_id: class_id as u32,
                    confidence: score,
                    bbox: BoundingBox::new(
                        row[1] * width,
                        row[0] * height,
                        row[3] * width,
                        row[2] * height,
                    ),
                });
            }
        }
        Ok(candidates)
    }
}

pub struct Postprocessor {
    decoder: Box<dyn OutputDecoder>,
    thresholds: Thresholds,
}

impl Postprocessor {
    pub fn new(layout: OutputLayout, num_classes: usize, thresholds: Thresholds) -> Self {
        Self::with_decoder(decoder_for(layout, num_classes), thresholds)
    }

    pub fn with_decoder(decoder: Box<dyn OutputDecoder>, thresholds: Thresholds) -> Self {
        Self {
            decoder,
            thresholds,
        }
    }

    /// Decode one output tensor into detections on the source frame.
    pub fn decode(
        &self,
        output: &RawTensorOutput,
        letterbox: &Letterbox,
        sequence: u64,
    ) -> Result<Vec<Detection>, DecodeError> {
        let candidates = self.decoder.candidates(
            output,
            (letterbox.input_width, letterbox.input_height),
            self.thresholds.confidence_threshold,
        )?;
        let total = candidates.len();

        let mut kept = suppress(candidates, self.thresholds.iou_threshold);
        kept.truncate(self.thresholds.max_detections);

        let detections: Vec<Detection> = kept
            .into_iter()
            .filter_map(|candidate| {
                let (x1, y1) = letterbox.to_source(candidate.bbox.x1, candidate.bbox.y1);
                let (x2, y2) = letterbox.to_source(candidate.bbox.x2, candidate.bbox.y2);
                let bbox = BoundingBox::new(x1, y1, x2, y2);
                (!bbox.is_degenerate()).then_some(Detection {
                    class_id: candidate.class_id,
                    confidence: candidate.confidence,
                    bbox,
                    sequence,
                })
            })
            .collect();

        tracing::debug!(
            sequence,
            candidates = total,
            detections = detections.len(),
            "decoded output"
        );
        Ok(detections)
    }
}
