//! Inference output as seen by the streaming pipeline.
//!
//! Engines build these through the constructors here, which is the only
//! place keypoint counts are checked. Everything downstream takes them as
//! given.

use super::keypoint::Pose;

/// Bounding box in pixel coordinates (x1, y1, x2, y2).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Degenerate or non-finite boxes count as zero area.
    pub fn area(&self) -> f64 {
        let area = (self.x2 - self.x1) * (self.y2 - self.y1);
        if area.is_finite() && area > 0.0 {
            area
        } else {
            0.0
        }
    }

    /// Intersection over union; 0 when either box is degenerate.
    pub fn iou(&self, other: &BBox) -> f64 {
        let ix = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let iy = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = ix * iy;
        let union = self.area() + other.area() - inter;
        if inter.is_finite() && union > 0.0 { inter / union } else { 0.0 }
    }
}

/// One detected person in one inference cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Subject {
    pub track_id: Option<i64>,
    pub class_id: Option<u32>,
    pub bbox: Option<BBox>,
    pub pose: Pose,
}

impl Subject {
    pub fn new(pose: Pose) -> Self {
        Self {
            track_id: None,
            class_id: None,
            bbox: None,
            pose,
        }
    }

    /// `None` when the engine produced fewer than 17 keypoint rows.
    pub fn from_rows(rows: &[[f64; 3]]) -> Option<Self> {
        Pose::from_rows(rows).map(Self::new)
    }

    pub fn with_track_id(mut self, track_id: i64) -> Self {
        self.track_id = Some(track_id);
        self
    }

    pub fn with_class_id(mut self, class_id: u32) -> Self {
        self.class_id = Some(class_id);
        self
    }

    pub fn with_bbox(mut self, bbox: BBox) -> Self {
        self.bbox = Some(bbox);
        self
    }

    pub fn area(&self) -> f64 {
        self.bbox.map_or(0.0, |b| b.area())
    }
}

/// Hand landmarks (x, y, score) for one hand.
pub type HandKeypoints = Vec<[f64; 3]>;

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    /// Source frame size in pixels
    pub width: u32,
    pub height: u32,
    pub subjects: Vec<Subject>,
    pub hands: Vec<HandKeypoints>,
}

impl DetectionResult {
    pub fn new(width: u32, height: u32, subjects: Vec<Subject>) -> Self {
        Self {
            width,
            height,
            subjects,
            hands: Vec::new(),
        }
    }

    pub fn with_hands(mut self, hands: Vec<HandKeypoints>) -> Self {
        self.hands = hands;
        self
    }

    /// Whether the engine is running with a tracker (any subject has an id).
    pub fn has_track_ids(&self) -> bool {
        self.subjects.iter().any(|s| s.track_id.is_some())
    }
}
