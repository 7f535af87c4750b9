//! Persistent person identities across video frames.
//!
//! Feed per-frame face, body and pose detections into an
//! [`IdentityTracker`]. Faces are matched to known identities by embedding
//! distance; unmatched faces are clustered until they have been seen for
//! enough consecutive frames to become a new identity. Identities that stay
//! unseen are marked lost and eventually retired to storage. Registered
//! analysis plugins run periodically against every visible identity.

pub mod analysis;
pub mod config;
pub mod error;
pub mod identity;
pub mod integration;
pub mod tracker;

pub use analysis::{Crop, Execution, FnPlugin, InputKind, Plugin, PluginOutcome, PluginResult};
pub use config::{DistanceMetric, SchedulerConfig, TrackerConfig, WeightingConfig};
pub use error::{ConfigError, PluginError, StorageError, TrackingError};
pub use identity::{Identity, IdentityRecord, IdentitySnapshot, IdentityState};
pub use integration::{
    DetectionBuilder, DetectionSource, IdentityStorage, MemoryStorage, TrackerPipeline,
};
pub use tracker::{Detection, DetectionKind, Frame, FrameReport, IdentityTracker, Keypoint, Rect};
