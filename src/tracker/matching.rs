//! Matching face detections to tracked identities.

use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2};
use tracing::debug;

use crate::config::{DistanceMetric, TrackerConfig, WeightingConfig};
use crate::error::TrackingError;
use crate::identity::{Identity, IdentityStore, Sample};
use crate::tracker::detection::{Detection, DetectionKind, FaceObservation};

impl DistanceMetric {
    /// Distance between two embeddings. Mismatched lengths are infinitely far
    /// apart.
    pub fn distance(&self, a: &Array1<f32>, b: &Array1<f32>) -> f32 {
        if a.len() != b.len() || a.is_empty() {
            return f32::INFINITY;
        }
        match self {
            Self::Euclidean => a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
            Self::Cosine => {
                let norm_a = a.dot(a).sqrt();
                let norm_b = b.dot(b).sqrt();
                if norm_a == 0.0 || norm_b == 0.0 {
                    return 1.0;
                }
                1.0 - a.dot(b) / (norm_a * norm_b)
            }
        }
    }
}

/// Adjusts a raw embedding distance by how well sampled the identity is.
///
/// Implementations must be monotonic in `distance`: a closer raw distance
/// never produces a larger adjusted one for the same `sample_count`.
pub trait SampleWeighting: Send + Sync {
    fn adjust(&self, distance: f32, sample_count: u64) -> f32;
}

/// Step weighting: a flat bonus for well-sampled identities and a flat
/// penalty for sparsely sampled ones.
#[derive(Debug, Clone, PartialEq)]
pub struct StepWeighting {
    config: WeightingConfig,
}

impl StepWeighting {
    pub fn new(config: WeightingConfig) -> Self {
        Self { config }
    }
}

impl SampleWeighting for StepWeighting {
    fn adjust(&self, distance: f32, sample_count: u64) -> f32 {
        if sample_count >= self.config.bonus_min_samples {
            distance * self.config.bonus_factor
        } else if sample_count <= self.config.penalty_max_samples {
            distance * self.config.penalty_factor
        } else {
            distance
        }
    }
}

/// Leaves distances untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoWeighting;

impl SampleWeighting for NoWeighting {
    fn adjust(&self, distance: f32, _sample_count: u64) -> f32 {
        distance
    }
}

/// Decision for one face detection in one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    /// Confident match to an existing identity.
    Matched { id: u64, distance: f32 },
    /// Close to an identity but not close enough; routed to candidates.
    Ambiguous { nearest: u64, distance: f32 },
    /// Far from every identity; seeds or joins a candidate cluster.
    Novel,
}

impl Assignment {
    pub fn matched_id(&self) -> Option<u64> {
        match self {
            Self::Matched { id, .. } => Some(*id),
            _ => None,
        }
    }
}

/// Assignment of every valid face detection of a frame, index-aligned with
/// the detections passed to [`Matcher::assign`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameAssignment {
    pub assignments: Vec<Assignment>,
}

impl FrameAssignment {
    pub fn matched_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.assignments.iter().filter_map(Assignment::matched_id)
    }

    /// Indices of detections routed to candidate clustering.
    pub fn unmatched(&self) -> impl Iterator<Item = usize> + '_ {
        self.assignments
            .iter()
            .enumerate()
            .filter(|(_, assignment)| assignment.matched_id().is_none())
            .map(|(index, _)| index)
    }
}

/// Weighted nearest-neighbour matcher over identity representatives.
pub struct Matcher {
    match_threshold: f32,
    candidate_threshold: f32,
    embedding_dim: usize,
    metric: DistanceMetric,
    weighting: Box<dyn SampleWeighting>,
}

impl Matcher {
    pub fn new(config: &TrackerConfig) -> Self {
        Self::with_weighting(config, StepWeighting::new(config.weighting.clone()))
    }

    pub fn with_weighting(
        config: &TrackerConfig,
        weighting: impl SampleWeighting + 'static,
    ) -> Self {
        Self {
            match_threshold: config.match_threshold,
            candidate_threshold: config.candidate_threshold,
            embedding_dim: config.embedding_dim,
            metric: config.metric,
            weighting: Box::new(weighting),
        }
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    pub fn match_threshold(&self) -> f32 {
        self.match_threshold
    }

    /// Extract a usable face observation, or `None` for anything malformed:
    /// a non-face detection, a missing embedding, the wrong dimensionality,
    /// non-finite components or an all-zero vector.
    pub(crate) fn observe(&self, detection: &Detection) -> Option<FaceObservation> {
        if detection.kind != DetectionKind::Face {
            return None;
        }
        let embedding = detection.embedding.as_ref()?;
        if embedding.len() != self.embedding_dim {
            debug!(
                got = embedding.len(),
                expected = self.embedding_dim,
                "Dropping face detection with wrong embedding size"
            );
            return None;
        }
        if !embedding.iter().all(|v| v.is_finite()) || embedding.iter().all(|v| *v == 0.0) {
            debug!("Dropping face detection with degenerate embedding");
            return None;
        }
        Some(FaceObservation {
            bbox: detection.bbox,
            embedding: embedding.clone(),
        })
    }

    /// Raw distance to the identity's representative, adjusted by its
    /// sample count.
    pub fn adjusted_distance(&self, embedding: &Array1<f32>, identity: &Identity) -> f32 {
        let raw = self.metric.distance(embedding, identity.representative());
        self.weighting.adjust(raw, identity.sample_count())
    }

    /// Assign each face to at most one identity, each identity to at most one
    /// face.
    ///
    /// Resolution is greedy over (distance, identity id, detection index):
    /// the closest pair wins and the loser falls through to its next best
    /// remaining identity. Not globally optimal, but deterministic.
    pub(crate) fn assign(
        &self,
        faces: &[FaceObservation],
        store: &IdentityStore,
    ) -> FrameAssignment {
        let identities: Vec<&Identity> = store.matchable().collect();
        let keys: Vec<u64> = identities.iter().map(|identity| identity.id()).collect();

        let mut cost = Array2::from_elem((faces.len(), identities.len()), f32::INFINITY);
        for (i, face) in faces.iter().enumerate() {
            for (j, identity) in identities.iter().enumerate() {
                cost[[i, j]] = self.adjusted_distance(&face.embedding, identity);
            }
        }

        let row_to_col = greedy_assign(&cost, &keys, self.match_threshold);
        let mut taken = vec![false; keys.len()];
        for col in row_to_col.iter().flatten() {
            taken[*col] = true;
        }

        let assignments = row_to_col
            .iter()
            .enumerate()
            .map(|(i, matched)| match matched {
                Some(j) => Assignment::Matched {
                    id: keys[*j],
                    distance: cost[[i, *j]],
                },
                None => {
                    let nearest = (0..keys.len())
                        .filter(|j| !taken[*j])
                        .min_by(|a, b| {
                            cost[[i, *a]]
                                .total_cmp(&cost[[i, *b]])
                                .then(keys[*a].cmp(&keys[*b]))
                        });
                    match nearest {
                        Some(j) if cost[[i, j]] < self.candidate_threshold => {
                            Assignment::Ambiguous {
                                nearest: keys[j],
                                distance: cost[[i, j]],
                            }
                        }
                        _ => Assignment::Novel,
                    }
                }
            })
            .collect();

        FrameAssignment { assignments }
    }

    /// Append every matched embedding to its identity and mark it visible.
    pub(crate) fn absorb(
        &self,
        store: &mut IdentityStore,
        faces: &[FaceObservation],
        assignment: &FrameAssignment,
        now: DateTime<Utc>,
    ) -> Result<(), TrackingError> {
        for (face, decision) in faces.iter().zip(&assignment.assignments) {
            if let Assignment::Matched { id, distance } = decision {
                let sample = Sample::new(face.embedding.clone(), now);
                store.observe(*id, sample, face.bbox, *distance)?;
            }
        }
        Ok(())
    }
}

/// Greedy one-to-one assignment of rows to columns.
///
/// Only pairs with cost strictly below `threshold` are considered. Pairs are
/// taken in ascending (cost, column key, row) order.
pub(crate) fn greedy_assign(
    cost: &Array2<f32>,
    col_keys: &[u64],
    threshold: f32,
) -> Vec<Option<usize>> {
    let (rows, cols) = cost.dim();

    let mut pairs: Vec<(f32, u64, usize, usize)> = cost
        .indexed_iter()
        .filter(|(_, c)| **c < threshold)
        .map(|((i, j), c)| (*c, col_keys[j], i, j))
        .collect();
    pairs.sort_by(|a, b| {
        a.0.total_cmp(&b.0)
            .then(a.1.cmp(&b.1))
            .then(a.2.cmp(&b.2))
    });

    let mut row_to_col = vec![None; rows];
    let mut col_used = vec![false; cols];
    for (_, _, i, j) in pairs {
        if row_to_col[i].is_none() && !col_used[j] {
            row_to_col[i] = Some(j);
            col_used[j] = true;
        }
    }
    row_to_col
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::rect::Rect;
    use approx::assert_relative_eq;
    use chrono::TimeZone;
    use ndarray::array;

    fn config() -> TrackerConfig {
        TrackerConfig {
            embedding_dim: 2,
            ..TrackerConfig::default()
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn face(x: f32, y: f32) -> FaceObservation {
        FaceObservation {
            bbox: Rect::new(0.0, 0.0, 10.0, 10.0),
            embedding: array![x, y],
        }
    }

    fn store_with(points: &[(f32, f32, u64)]) -> IdentityStore {
        let mut store = IdentityStore::new(10, 2);
        for (x, y, count) in points {
            store
                .create(
                    vec![Sample::new(array![*x, *y], t0())],
                    *count,
                    Rect::new(0.0, 0.0, 10.0, 10.0),
                    t0(),
                )
                .unwrap();
        }
        store
    }

    #[test]
    fn test_euclidean_and_cosine() {
        let a = array![1.0, 0.0];
        let b = array![0.0, 1.0];
        assert_relative_eq!(DistanceMetric::Euclidean.distance(&a, &b), 2f32.sqrt());
        assert_relative_eq!(DistanceMetric::Cosine.distance(&a, &b), 1.0);
        assert_relative_eq!(DistanceMetric::Cosine.distance(&a, &a), 0.0);
        assert_eq!(DistanceMetric::Euclidean.distance(&a, &array![1.0]), f32::INFINITY);
    }

    #[test]
    fn test_step_weighting() {
        let weighting = StepWeighting::new(WeightingConfig::default());
        assert_relative_eq!(weighting.adjust(0.4, 10), 0.38);
        assert_relative_eq!(weighting.adjust(0.4, 2), 0.4);
        assert_relative_eq!(weighting.adjust(0.4, 1), 0.42);
    }

    #[test]
    fn test_confident_ambiguous_and_novel() {
        let matcher = Matcher::with_weighting(&config(), NoWeighting);
        let store = store_with(&[(0.0, 0.0, 5), (10.0, 0.0, 5)]);
        let faces = [face(0.3, 0.0), face(10.55, 0.0), face(5.0, 5.0)];

        let assignment = matcher.assign(&faces, &store);
        assert_eq!(assignment.assignments[0].matched_id(), Some(1));
        assert!(matches!(
            assignment.assignments[1],
            Assignment::Ambiguous { nearest: 2, .. }
        ));
        assert_eq!(assignment.assignments[2], Assignment::Novel);
        assert_eq!(assignment.unmatched().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_closer_detection_wins_and_loser_falls_through() {
        let matcher = Matcher::with_weighting(&config(), NoWeighting);
        let store = store_with(&[(0.0, 0.0, 5), (0.6, 0.0, 5)]);
        // Both detections are closest to identity 1; the second is closer.
        let faces = [face(0.25, 0.0), face(0.1, 0.0)];

        let assignment = matcher.assign(&faces, &store);
        assert_eq!(assignment.assignments[1].matched_id(), Some(1));
        assert_eq!(assignment.assignments[0].matched_id(), Some(2));
    }

    #[test]
    fn test_ties_break_by_lowest_id() {
        let matcher = Matcher::with_weighting(&config(), NoWeighting);
        let store = store_with(&[(1.0, 0.0, 5), (-1.0, 0.0, 5)]);
        let faces = [face(0.0, 0.0)];
        let loose = TrackerConfig {
            match_threshold: 1.5,
            candidate_threshold: 2.0,
            ..config()
        };
        let matcher_loose = Matcher::with_weighting(&loose, NoWeighting);

        assert_eq!(
            matcher_loose.assign(&faces, &store).assignments[0].matched_id(),
            Some(1)
        );
        assert_eq!(matcher.assign(&faces, &store).assignments[0], Assignment::Novel);
    }

    #[test]
    fn test_assignment_independent_of_detection_order() {
        let matcher = Matcher::new(&config());
        let store = store_with(&[(0.0, 0.0, 5), (0.5, 0.0, 1), (3.0, 3.0, 3)]);
        let forward = [face(0.2, 0.0), face(0.3, 0.1), face(3.1, 3.0)];
        let backward = [forward[2].clone(), forward[1].clone(), forward[0].clone()];

        let a = matcher.assign(&forward, &store);
        let b = matcher.assign(&backward, &store);
        let a_ids: Vec<_> = a.assignments.iter().map(Assignment::matched_id).collect();
        let mut b_ids: Vec<_> = b.assignments.iter().map(Assignment::matched_id).collect();
        b_ids.reverse();
        assert_eq!(a_ids, b_ids);
    }

    #[test]
    fn test_sparse_identity_penalty_can_flip_match() {
        let matcher = Matcher::new(&config());
        // A single-sample identity is pushed over the match threshold.
        let store = store_with(&[(0.49, 0.0, 1)]);
        let assignment = matcher.assign(&[face(0.0, 0.0)], &store);
        assert!(matches!(
            assignment.assignments[0],
            Assignment::Ambiguous { nearest: 1, .. }
        ));
    }

    #[test]
    fn test_malformed_detections_rejected() {
        let matcher = Matcher::new(&config());
        let bbox = Rect::new(0.0, 0.0, 10.0, 10.0);

        assert!(matcher.observe(&Detection::face(bbox, array![0.1, 0.2])).is_some());
        assert!(matcher.observe(&Detection::face(bbox, array![0.0, 0.0])).is_none());
        assert!(matcher.observe(&Detection::face(bbox, array![f32::NAN, 0.2])).is_none());
        assert!(matcher.observe(&Detection::face(bbox, array![0.1, 0.2, 0.3])).is_none());
        assert!(matcher.observe(&Detection::body(bbox)).is_none());

        let mut missing = Detection::face(bbox, array![0.1, 0.2]);
        missing.embedding = None;
        assert!(matcher.observe(&missing).is_none());
    }

    #[test]
    fn test_greedy_assign_respects_threshold() {
        let cost = array![[0.1, 0.9], [0.2, 0.95]];
        assert_eq!(greedy_assign(&cost, &[1, 2], 0.5), vec![Some(0), None]);
    }
}
