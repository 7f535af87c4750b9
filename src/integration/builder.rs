//! Builder for creating Detection objects from various box formats.

use ndarray::Array1;

use crate::tracker::{Detection, DetectionKind, Keypoint, Rect};

/// Builder for `Detection` objects.
#[derive(Debug, Clone)]
pub struct DetectionBuilder {
    kind: DetectionKind,
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
    embedding: Option<Array1<f32>>,
    keypoints: Vec<Keypoint>,
}

impl Default for DetectionBuilder {
    fn default() -> Self {
        Self {
            kind: DetectionKind::Face,
            x1: 0.0,
            y1: 0.0,
            x2: 0.0,
            y2: 0.0,
            score: 1.0,
            embedding: None,
            keypoints: Vec::new(),
        }
    }
}

impl DetectionBuilder {
    /// Create a new builder for a face detection.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: DetectionKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set bounding box in TLBR format (x1, y1, x2, y2).
    pub fn tlbr(mut self, x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        self.x1 = x1;
        self.y1 = y1;
        self.x2 = x2;
        self.y2 = y2;
        self
    }

    /// Set bounding box in XYWH format (center_x, center_y, width, height).
    pub fn xywh(mut self, cx: f32, cy: f32, w: f32, h: f32) -> Self {
        self.x1 = cx - w / 2.0;
        self.y1 = cy - h / 2.0;
        self.x2 = cx + w / 2.0;
        self.y2 = cy + h / 2.0;
        self
    }

    /// Set bounding box in TLWH format (left, top, width, height).
    pub fn tlwh(mut self, x: f32, y: f32, w: f32, h: f32) -> Self {
        self.x1 = x;
        self.y1 = y;
        self.x2 = x + w;
        self.y2 = y + h;
        self
    }

    /// Set the confidence score.
    pub fn score(mut self, score: f32) -> Self {
        self.score = score;
        self
    }

    /// Set the face embedding.
    pub fn embedding(mut self, embedding: impl Into<Array1<f32>>) -> Self {
        self.embedding = Some(embedding.into());
        self
    }

    /// Add a pose landmark.
    pub fn keypoint(mut self, x: f32, y: f32, confidence: f32) -> Self {
        self.keypoints.push(Keypoint::new(x, y, confidence));
        self
    }

    /// Build the final `Detection`.
    pub fn build(self) -> Detection {
        Detection {
            kind: self.kind,
            bbox: Rect::from_tlbr(self.x1, self.y1, self.x2, self.y2),
            score: self.score,
            embedding: self.embedding,
            keypoints: self.keypoints,
        }
    }
}
