//! Trait for face, body and pose detection backends.

use crate::tracker::Detection;

/// Trait for detection backends feeding the identity tracker.
///
/// A backend reports every face it finds together with its embedding, and
/// optionally body and pose boxes. Face detections without an embedding are
/// ignored by the tracker.
///
/// # Example
///
/// ```ignore
/// use persona_track::{DetectionSource, Detection};
///
/// struct MyDetector {
///     // Your models here
/// }
///
/// impl DetectionSource for MyDetector {
///     type Error = std::io::Error;
///
///     fn detect(
///         &mut self,
///         input: &[u8],
///         width: u32,
///         height: u32,
///     ) -> Result<Vec<Detection>, Self::Error> {
///         // Run face detection and embedding extraction
///         Ok(vec![])
///     }
/// }
/// ```
pub trait DetectionSource {
    /// Error type for detection failures.
    type Error;

    /// Run inference on one frame.
    ///
    /// # Arguments
    /// * `input` - Packed RGB8 pixels, row-major
    /// * `width` - Image width in pixels
    /// * `height` - Image height in pixels
    fn detect(
        &mut self,
        input: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<Detection>, Self::Error>;
}
