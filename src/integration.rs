//! Collaborators around the tracker: detection backends and identity storage.
//!
//! The tracker never runs a model or touches a disk itself. Implement
//! [`DetectionSource`] to plug in a face/body/pose detector and
//! [`IdentityStorage`] to keep identities across restarts.

mod builder;
mod detector;
mod pipeline;
mod storage;

pub use builder::DetectionBuilder;
pub use detector::DetectionSource;
pub use pipeline::{PipelineError, TrackerPipeline};
pub use storage::{IdentityStorage, MemoryStorage};
