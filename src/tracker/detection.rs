//! Per-frame detector output consumed by the tracker.

use image::RgbImage;
use ndarray::Array1;

use crate::tracker::rect::Rect;

/// What a detection describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectionKind {
    Face,
    Body,
    Pose,
}

/// A single pose landmark in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, confidence: f32) -> Self {
        Self { x, y, confidence }
    }
}

/// Detection input for the tracker.
#[derive(Debug, Clone)]
pub struct Detection {
    pub kind: DetectionKind,
    /// Bounding box in frame pixels
    pub bbox: Rect,
    /// Detector confidence score
    pub score: f32,
    /// Face embedding; required for face detections, ignored otherwise
    pub embedding: Option<Array1<f32>>,
    /// Pose landmarks; only meaningful for pose detections
    pub keypoints: Vec<Keypoint>,
}

impl Detection {
    pub fn face(bbox: Rect, embedding: Array1<f32>) -> Self {
        Self {
            kind: DetectionKind::Face,
            bbox,
            score: 1.0,
            embedding: Some(embedding),
            keypoints: Vec::new(),
        }
    }

    pub fn body(bbox: Rect) -> Self {
        Self {
            kind: DetectionKind::Body,
            bbox,
            score: 1.0,
            embedding: None,
            keypoints: Vec::new(),
        }
    }

    pub fn pose(bbox: Rect, keypoints: Vec<Keypoint>) -> Self {
        Self {
            kind: DetectionKind::Pose,
            bbox,
            score: 1.0,
            embedding: None,
            keypoints,
        }
    }

    pub fn with_score(mut self, score: f32) -> Self {
        self.score = score;
        self
    }
}

/// Everything the detector produced for one video frame.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    pub detections: Vec<Detection>,
    /// Source image, used to cut plugin crops. Without it no plugin runs.
    pub image: Option<RgbImage>,
}

impl Frame {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self {
            detections,
            image: None,
        }
    }

    pub fn with_image(mut self, image: RgbImage) -> Self {
        self.image = Some(image);
        self
    }
}

/// A face detection that passed validation, ready for matching.
#[derive(Debug, Clone)]
pub(crate) struct FaceObservation {
    pub bbox: Rect,
    pub embedding: Array1<f32>,
}
