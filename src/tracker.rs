mod association;
mod candidate;
mod detection;
mod duplicates;
mod identity_tracker;
mod lifecycle;
mod matching;
mod rect;

pub use candidate::{CandidateCluster, CandidatePool};
pub use detection::{Detection, DetectionKind, Frame, Keypoint};
pub use duplicates::{DuplicateResolver, MergeProposal};
pub use identity_tracker::{FrameReport, IdentityTracker, VisibleIdentity};
pub use lifecycle::{LifecycleController, LifecycleEvents};
pub use matching::{
    Assignment, FrameAssignment, Matcher, NoWeighting, SampleWeighting, StepWeighting,
};
pub use rect::Rect;
