//! Candidate confirmation and the confirmed / lost / retired transitions.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::TrackerConfig;
use crate::error::TrackingError;
use crate::identity::{IdentityState, IdentityStore};
use crate::tracker::candidate::{CandidateCluster, CandidatePool};
use crate::tracker::detection::FaceObservation;
use crate::tracker::matching::{FrameAssignment, Matcher};

/// Lifecycle transitions that happened during one frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LifecycleEvents {
    /// Identities created from candidate clusters.
    pub promoted: Vec<u64>,
    /// Existing identities a confirmed candidate cluster was folded into.
    pub folded: Vec<u64>,
    /// Lost identities matched again.
    pub reidentified: Vec<u64>,
    /// Confirmed identities that went unmatched this frame.
    pub lost: Vec<u64>,
    /// Identities that exceeded the miss limit.
    pub retired: Vec<u64>,
    pub discarded_candidates: usize,
}

impl LifecycleEvents {
    /// Drop every mention of an identity merged away later in the same frame.
    pub(crate) fn forget(&mut self, id: u64) {
        for ids in [
            &mut self.promoted,
            &mut self.folded,
            &mut self.reidentified,
            &mut self.lost,
        ] {
            ids.retain(|&other| other != id);
        }
    }
}

pub struct LifecycleController {
    candidates: CandidatePool,
    max_missed_frames: u32,
}

impl LifecycleController {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            candidates: CandidatePool::new(config),
            max_missed_frames: config.max_missed_frames,
        }
    }

    pub fn candidates(&self) -> &CandidatePool {
        &self.candidates
    }

    /// Apply one frame's outcome to the store.
    ///
    /// Must run after the matcher has absorbed its matches: visibility is what
    /// decides whether an identity was seen this frame.
    pub(crate) fn advance(
        &mut self,
        store: &mut IdentityStore,
        matcher: &Matcher,
        faces: &[FaceObservation],
        assignment: &FrameAssignment,
        now: DateTime<Utc>,
    ) -> Result<LifecycleEvents, TrackingError> {
        let mut events = LifecycleEvents::default();

        let routed: Vec<&FaceObservation> = assignment.unmatched().map(|i| &faces[i]).collect();
        let tick = self.candidates.update(&routed, now);
        events.discarded_candidates = tick.discarded;
        if tick.discarded > 0 {
            debug!(count = tick.discarded, "Discarded stale candidate clusters");
        }

        for cluster in tick.ready {
            match fold_target(store, matcher, &cluster) {
                Some((id, distance)) => {
                    let face = cluster.last_face();
                    store.observe_many(id, cluster.into_samples(), face, distance)?;
                    info!(id, distance, "Candidate matched a known identity, folding it in");
                    events.folded.push(id);
                }
                None => {
                    let face = cluster.last_face();
                    let sample_count = cluster.sample_count();
                    let id = store.create(cluster.into_samples(), sample_count, face, now)?;
                    info!(id, samples = sample_count, "Promoted candidate to identity");
                    events.promoted.push(id);
                }
            }
        }

        for id in store.matchable_ids() {
            let identity = store.active_mut(id)?;
            if identity.is_visible() {
                if identity.mark_matched(now) {
                    debug!(id, "Re-identified lost identity");
                    events.reidentified.push(id);
                }
                continue;
            }

            let was_confirmed = identity.state() == IdentityState::Confirmed;
            match identity.mark_missed(self.max_missed_frames) {
                IdentityState::Retired => {
                    info!(id, missed = identity.missed_frames(), "Retired identity");
                    events.retired.push(id);
                }
                _ if was_confirmed => events.lost.push(id),
                _ => {}
            }
        }

        Ok(events)
    }
}

/// Closest identity not seen this frame that the cluster already matches.
fn fold_target(
    store: &IdentityStore,
    matcher: &Matcher,
    cluster: &CandidateCluster,
) -> Option<(u64, f32)> {
    store
        .matchable()
        .filter(|identity| !identity.is_visible())
        .map(|identity| (identity.id(), matcher.adjusted_distance(cluster.centroid(), identity)))
        .filter(|(_, distance)| *distance < matcher.match_threshold())
        .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
}
