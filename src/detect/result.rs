use serde::{Deserialize, Serialize};

use crate::Category;

/// Axis-aligned box in pixel coordinates: `(x1, y1)` top-left, `(x2, y2)` bottom-right.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
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

    /// Build from a centre point and size, as YOLO heads emit them.
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x1: cx - w / 2.0,
            y1: cy - h / 2.0,
            x2: cx + w / 2.0,
            y2: cy + h / 2.0,
        }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn intersection(&self, other: &BoundingBox) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        w * h
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter = self.intersection(other);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Clamp to a `width` x `height` frame. Returns `None` when nothing visible remains.
    pub fn clamped(&self, width: u32, height: u32) -> Option<BoundingBox> {
        let (w, h) = (width as f32, height as f32);
        let clamped = BoundingBox {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        };
        if clamped.width() < 1.0 || clamped.height() < 1.0 {
            None
        } else {
            Some(clamped)
        }
    }
}

/// One region reported by a detector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub label: String,
    /// Model confidence in `[0, 1]`.
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub category: Category,
}

impl DetectionResult {
    pub fn new(
        category: Category,
        label: impl Into<String>,
        confidence: f32,
        bbox: BoundingBox,
    ) -> Self {
        Self {
            label: label.into(),
            confidence: confidence.clamp(0.0, 1.0),
            bbox,
            category,
        }
    }
}

/// Greedy non-maximum suppression, highest confidence first.
#[cfg_attr(not(feature = "backend-tract"), allow(dead_code))]
pub(crate) fn non_max_suppression(detections: &mut Vec<DetectionResult>, iou_threshold: f32) {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept = 0;
    for index in 0..detections.len() {
        let overlaps = (0..kept).any(|prev| {
            detections[prev].label == detections[index].label
                && detections[prev].bbox.iou(&detections[index].bbox) > iou_threshold
        });
        if !overlaps {
            detections.swap(kept, index);
            kept += 1;
        }
    }
    detections.truncate(kept);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        assert!((a.iou(&a) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn from_center_matches_corners() {
        let b = BoundingBox::from_center(50.0, 40.0, 20.0, 10.0);
        assert_eq!(b, BoundingBox::new(40.0, 35.0, 60.0, 45.0));
    }

    #[test]
    fn nms_keeps_strongest_of_overlapping_same_label() {
        let mut dets = vec![
            DetectionResult::new(Category::Object, "car", 0.6, BoundingBox::new(0.0, 0.0, 10.0, 10.0)),
            DetectionResult::new(Category::Object, "car", 0.9, BoundingBox::new(1.0, 1.0, 11.0, 11.0)),
            DetectionResult::new(Category::Object, "dog", 0.5, BoundingBox::new(0.0, 0.0, 10.0, 10.0)),
            DetectionResult::new(Category::Object, "car", 0.7, BoundingBox::new(50.0, 50.0, 60.0, 60.0)),
        ];
        non_max_suppression(&mut dets, 0.45);

        let kept: Vec<_> = dets.iter().map(|d| (d.label.as_str(), d.confidence)).collect();
        assert_eq!(kept, vec![("car", 0.9), ("car", 0.7), ("dog", 0.5)]);
    }

    #[test]
    fn confidence_is_clamped() {
        let d = DetectionResult::new(Category::Fire, "Fire", 1.7, BoundingBox::default());
        assert_eq!(d.confidence, 1.0);
    }
}
