//! Image regions handed to plugins.

use std::collections::HashMap;
use std::sync::Arc;

use image::{RgbImage, imageops};

use crate::analysis::plugin::InputKind;
use crate::identity::Identity;
use crate::tracker::{Keypoint, Rect};

/// A region of the current frame cut out for one identity.
#[derive(Debug, Clone)]
pub struct Crop {
    pub kind: InputKind,
    /// Region of the frame the crop was cut from, after clipping.
    pub region: Rect,
    pub image: RgbImage,
    /// Pose landmarks in frame coordinates; empty for other kinds.
    pub keypoints: Vec<Keypoint>,
}

impl Crop {
    pub fn new(kind: InputKind, region: Rect, image: RgbImage) -> Self {
        Self {
            kind,
            region,
            image,
            keypoints: Vec::new(),
        }
    }

    pub fn with_keypoints(mut self, keypoints: Vec<Keypoint>) -> Self {
        self.keypoints = keypoints;
        self
    }

    /// Cut `region` out of `frame`. `None` when the region lies outside it.
    pub fn cut(frame: &RgbImage, kind: InputKind, region: Rect) -> Option<Self> {
        let (x, y, width, height) = region.clamp_to(frame.width(), frame.height())?;
        let image = imageops::crop_imm(frame, x, y, width, height).to_image();
        let region = Rect::new(x as f32, y as f32, width as f32, height as f32);
        Some(Self::new(kind, region, image))
    }
}

/// Lazily cut crops for one frame, each made at most once.
pub(crate) struct CropCache<'a> {
    frame: &'a RgbImage,
    whole: Option<Arc<Crop>>,
    cut: HashMap<(u64, InputKind), Option<Arc<Crop>>>,
}

impl<'a> CropCache<'a> {
    pub(crate) fn new(frame: &'a RgbImage) -> Self {
        Self {
            frame,
            whole: None,
            cut: HashMap::new(),
        }
    }

    /// The crop of `kind` for `identity`, if it has that region this frame.
    pub(crate) fn get(&mut self, identity: &Identity, kind: InputKind) -> Option<Arc<Crop>> {
        if kind == InputKind::Generic {
            let frame = self.frame;
            let whole = self.whole.get_or_insert_with(|| {
                let region = Rect::new(0.0, 0.0, frame.width() as f32, frame.height() as f32);
                Arc::new(Crop::new(InputKind::Generic, region, frame.clone()))
            });
            return Some(Arc::clone(whole));
        }

        let frame = self.frame;
        self.cut
            .entry((identity.id(), kind))
            .or_insert_with(|| {
                let boxes = identity.boxes();
                let crop = match kind {
                    InputKind::Face => Crop::cut(frame, kind, boxes.face?),
                    InputKind::Body => Crop::cut(frame, kind, boxes.body?),
                    InputKind::Pose => Crop::cut(frame, kind, boxes.pose?)
                        .map(|crop| crop.with_keypoints(boxes.keypoints.clone())),
                    InputKind::Generic => None,
                };
                crop.map(Arc::new)
            })
            .clone()
    }
}
