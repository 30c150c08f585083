use serde::ser::{Serialize, Serializer};

/// Axis-aligned box in pixel coordinates of the input image.
///
/// Serialized as `[x1, y1, x2, y2]`.
#[derive(Clone, Copy, Debug, PartialEq)]
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

    /// Build from a center point and size, the layout YOLO heads emit.
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

    /// True when the box has positive finite extent on both axes.
    pub fn is_valid(&self) -> bool {
        [self.x1, self.y1, self.x2, self.y2]
            .iter()
            .all(|v| v.is_finite())
            && self.x1 < self.x2
            && self.y1 < self.y2
    }

    /// Clip the box to `[0, width] x [0, height]`.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        Self {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        }
    }

    pub fn scale(&self, sx: f32, sy: f32) -> Self {
        Self {
            x1: self.x1 * sx,
            y1: self.y1 * sy,
            x2: self.x2 * sx,
            y2: self.y2 * sy,
        }
    }

    /// Intersection over union; 0 for disjoint or degenerate boxes.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        if ix2 <= ix1 || iy2 <= iy1 {
            return 0.0;
        }
        let inter = (ix2 - ix1) * (iy2 - iy1);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 || !union.is_finite() {
            return 0.0;
        }
        inter / union
    }
}

impl Serialize for BoundingBox {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        [self.x1, self.y1, self.x2, self.y2].serialize(serializer)
    }
}

/// One recognized object instance.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    #[serde(rename = "class")]
    pub class_id: usize,
    pub label: String,
}

impl Detection {
    pub fn new(
        bbox: BoundingBox,
        confidence: f32,
        class_id: usize,
        label: impl Into<String>,
    ) -> Self {
        Self {
            bbox,
            confidence,
            class_id,
            label: label.into(),
        }
    }
}

/// Greedy per-class non-maximum suppression. Highest confidence wins.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.retain(|d| d.confidence.is_finite());
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections {
        let overlaps = keep
            .iter()
            .any(|k| k.class_id == det.class_id && k.bbox.iou(&det.bbox) > iou_threshold);
        if !overlaps {
            keep.push(det);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_serializes_as_corner_array() {
        let det = Detection::new(BoundingBox::new(1.0, 2.0, 30.5, 40.0), 0.5, 2, "car");
        let json = serde_json::to_value(&det).unwrap();
        assert_eq!(json["bbox"], serde_json::json!([1.0, 2.0, 30.5, 40.0]));
        assert_eq!(json["class"], 2);
        assert_eq!(json["label"], "car");
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&b), 0.0);

        let half = BoundingBox::new(5.0, 0.0, 15.0, 10.0);
        assert!((a.iou(&half) - 1.0 / 3.0).abs() < 1e-4);
    }

    #[test]
    fn clamp_keeps_box_inside_image() {
        let b = BoundingBox::from_center(5.0, 5.0, 20.0, 20.0).clamp_to(8, 8);
        assert_eq!(b, BoundingBox::new(0.0, 0.0, 8.0, 8.0));
        assert!(b.is_valid());
        assert!(!BoundingBox::new(3.0, 3.0, 3.0, 9.0).is_valid());
    }

    #[test]
    fn nms_suppresses_same_class_overlaps_only() {
        let dets = vec![
            Detection::new(BoundingBox::new(0.0, 0.0, 10.0, 10.0), 0.6, 2, "car"),
            Detection::new(BoundingBox::new(1.0, 1.0, 11.0, 11.0), 0.9, 2, "car"),
            Detection::new(BoundingBox::new(1.0, 1.0, 11.0, 11.0), 0.7, 7, "truck"),
            Detection::new(BoundingBox::new(50.0, 50.0, 60.0, 60.0), 0.3, 2, "car"),
        ];
        let kept = non_max_suppression(dets, 0.45);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].label, "truck");
        assert_eq!(kept[2].bbox.x1, 50.0);
    }
}
