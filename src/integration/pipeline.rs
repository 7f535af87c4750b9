//! TrackerPipeline for combining detection with identity tracking.

use chrono::{DateTime, Utc};
use image::RgbImage;
use thiserror::Error;
use tracing::debug;

use crate::config::TrackerConfig;
use crate::error::TrackingError;
use crate::tracker::{Frame, FrameReport, IdentityTracker};

use super::{DetectionSource, IdentityStorage};

/// Failure of one pipeline step.
#[derive(Debug, Error)]
pub enum PipelineError<E> {
    /// The detection backend failed on this frame.
    #[error("detection failed: {0}")]
    Detection(E),

    #[error(transparent)]
    Tracking(#[from] TrackingError),
}

/// Bundles a `DetectionSource` with an `IdentityTracker`.
pub struct TrackerPipeline<D: DetectionSource> {
    detector: D,
    tracker: IdentityTracker,
}

impl<D: DetectionSource> TrackerPipeline<D> {
    /// Create a pipeline with in-memory identity storage.
    pub fn new(detector: D, config: TrackerConfig) -> Result<Self, TrackingError> {
        Ok(Self {
            detector,
            tracker: IdentityTracker::new(config)?,
        })
    }

    /// Create a pipeline that restores and persists identities through
    /// `storage`.
    pub fn with_storage(
        detector: D,
        config: TrackerConfig,
        storage: impl IdentityStorage + 'static,
    ) -> Result<Self, TrackingError> {
        Ok(Self {
            detector,
            tracker: IdentityTracker::with_storage(config, storage)?,
        })
    }

    /// Create a pipeline with default tracker configuration.
    pub fn with_default_config(detector: D) -> Result<Self, TrackingError> {
        Self::new(detector, TrackerConfig::default())
    }

    /// Run detection on one RGB8 frame and feed the result to the tracker.
    ///
    /// When `input` is not exactly `width * height * 3` bytes the frame is
    /// still tracked, but no plugin crops can be cut from it.
    pub fn process_frame(
        &mut self,
        input: &[u8],
        width: u32,
        height: u32,
        now: DateTime<Utc>,
    ) -> Result<FrameReport, PipelineError<D::Error>> {
        let detections = self
            .detector
            .detect(input, width, height)
            .map_err(PipelineError::Detection)?;

        let mut frame = Frame::new(detections);
        match RgbImage::from_raw(width, height, input.to_vec()) {
            Some(image) => frame = frame.with_image(image),
            None => debug!(
                width,
                height,
                bytes = input.len(),
                "Frame bytes do not form an RGB8 image"
            ),
        }

        Ok(self.tracker.process_frame(&frame, now)?)
    }

    /// Get a reference to the underlying detector.
    pub fn detector(&self) -> &D {
        &self.detector
    }

    /// Get a mutable reference to the underlying detector.
    pub fn detector_mut(&mut self) -> &mut D {
        &mut self.detector
    }

    /// Get a reference to the underlying tracker.
    pub fn tracker(&self) -> &IdentityTracker {
        &self.tracker
    }

    /// Get a mutable reference to the underlying tracker.
    pub fn tracker_mut(&mut self) -> &mut IdentityTracker {
        &mut self.tracker
    }
}
