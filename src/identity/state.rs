use serde::{Deserialize, Serialize};

/// Lifecycle state of a tracked identity.
///
/// Candidates are not identities yet; they live in the
/// [`CandidatePool`](crate::tracker::CandidatePool) until promoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityState {
    /// Matched in the most recent frame it was processed for
    #[default]
    Confirmed,
    /// Not matched recently but still eligible for re-identification
    Lost,
    /// Permanently excluded from matching. Terminal.
    Retired,
}

impl IdentityState {
    /// Whether detections may still be matched against this identity.
    pub fn is_matchable(self) -> bool {
        matches!(self, Self::Confirmed | Self::Lost)
    }

    pub fn is_retired(self) -> bool {
        self == Self::Retired
    }
}
