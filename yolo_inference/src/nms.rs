use serde::Serialize;

/// Axis-aligned box in corner form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x1: cx - w / 2.,
            y1: cy - h / 2.,
            x2: cx + w / 2.,
            y2: cy + h / 2.,
        }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn is_degenerate(&self) -> bool {
        self.width() <= 0. || self.height() <= 0.
    }

    pub fn intersection(&self, other: &BoundingBox) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.);
        w * h
    }

    pub fn union(&self, other: &BoundingBox) -> f32 {
        self.area() + other.area() - self.intersection(other)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let union = self.union(other);
        if union <= 0. {
            return 0.;
        }
        self.intersection(other) / union
    }
}

/// Anything that can take part in class-wise duplicate suppression.
pub trait Suppressible {
    fn class_id(&self) -> u32;
    fn confidence(&self) -> f32;
    fn bbox(&self) -> &BoundingBox;
}

/// Class-wise greedy non-maximum suppression.
///
/// Candidates are visited by descending confidence; equal confidences keep
/// their input order. A candidate survives only if its IoU with every kept
/// candidate of the same class is below `iou_threshold`.
pub fn suppress<T: Suppressible>(mut candidates: Vec<T>, iou_threshold: f32) -> Vec<T> {
    candidates.sort_by(|a, b| b.confidence().total_cmp(&a.confidence()));

    let mut kept: Vec<T> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let duplicate = kept.iter().any(|k| {
            k.class_id() == candidate.class_id()
                && k.bbox().iou(candidate.bbox()) >= iou_threshold
        });
        if !duplicate {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Scored {
        class_id: u32,
        confidence: f32,
        bbox: BoundingBox,
    }

    impl Suppressible for Scored {
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

    fn scored(class_id: u32, confidence: f32, x1: f32) -> Scored {
        Scored {
            class_id,
            confidence,
            bbox: BoundingBox::new(x1, 0., x1 + 10., 10.),
        }
    }

    #[test]
    fn test_iou_of_disjoint_boxes_is_zero() {
        let a = BoundingBox::new(0., 0., 10., 10.);
        let b = BoundingBox::new(20., 20., 30., 30.);

        assert_eq!(a.intersection(&b), 0.);
        assert_eq!(a.iou(&b), 0.);
    }

    #[test]
    fn test_iou_of_half_overlap() {
        let a = BoundingBox::new(0., 0., 10., 10.);
        let b = BoundingBox::new(5., 0., 15., 10.);

        assert!((a.iou(&b) - 1. / 3.).abs() < 1e-6);
    }

    #[test]
    fn test_suppress_keeps_other_classes() {
        let kept = suppress(vec![scored(0, 0.9, 0.), scored(1, 0.8, 1.)], 0.45);

        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_suppress_drops_same_class_overlap() {
        let kept = suppress(vec![scored(0, 0.6, 1.), scored(0, 0.9, 0.)], 0.45);

        assert_eq!(kept, vec![scored(0, 0.9, 0.)]);
    }

    #[test]
    fn test_suppress_ties_keep_input_order() {
        let kept = suppress(vec![scored(0, 0.7, 0.), scored(0, 0.7, 1.)], 0.45);

        assert_eq!(kept, vec![scored(0, 0.7, 0.)]);
    }

    #[test]
    fn test_suppress_is_idempotent() {
        let input = vec![
            scored(0, 0.9, 0.),
            scored(0, 0.8, 2.),
            scored(0, 0.7, 30.),
            scored(2, 0.6, 0.),
        ];
        let once = suppress(input, 0.45);
        let twice = suppress(once.clone(), 0.45);

        assert_eq!(once, twice);
        assert_eq!(once.len(), 3);
    }
}
