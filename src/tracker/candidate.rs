//! Clusters of unconfirmed face observations waiting for promotion.

use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2};

use crate::config::{DistanceMetric, TrackerConfig};
use crate::identity::{Sample, SampleBuffer};
use crate::tracker::detection::FaceObservation;
use crate::tracker::matching::greedy_assign;
use crate::tracker::rect::Rect;

/// A group of similar unmatched observations that may become an identity.
#[derive(Debug, Clone)]
pub struct CandidateCluster {
    key: u64,
    samples: SampleBuffer,
    sample_count: u64,
    streak: u32,
    idle_frames: u32,
    age: u32,
    last_face: Rect,
}

impl CandidateCluster {
    fn open(key: u64, capacity: usize, face: &FaceObservation, now: DateTime<Utc>) -> Self {
        let mut samples = SampleBuffer::new(capacity);
        samples.push(Sample::new(face.embedding.clone(), now));
        Self {
            key,
            samples,
            sample_count: 1,
            streak: 1,
            idle_frames: 0,
            age: 1,
            last_face: face.bbox,
        }
    }

    fn feed(&mut self, face: &FaceObservation, now: DateTime<Utc>) {
        self.samples.push(Sample::new(face.embedding.clone(), now));
        self.sample_count += 1;
        self.streak += 1;
        self.idle_frames = 0;
        self.last_face = face.bbox;
    }

    fn starve(&mut self) {
        self.streak = 0;
        self.idle_frames += 1;
    }

    /// Consecutive frames this cluster has been fed.
    pub fn streak(&self) -> u32 {
        self.streak
    }

    pub fn idle_frames(&self) -> u32 {
        self.idle_frames
    }

    /// Frames since the cluster was opened, the opening frame included.
    pub fn age(&self) -> u32 {
        self.age
    }

    pub fn centroid(&self) -> &Array1<f32> {
        self.samples.centroid()
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub(crate) fn last_face(&self) -> Rect {
        self.last_face
    }

    pub(crate) fn into_samples(self) -> Vec<Sample> {
        self.samples.into_samples()
    }
}

/// What one frame did to the candidate pool.
#[derive(Debug, Default)]
pub(crate) struct CandidateTick {
    /// Clusters that reached the confirmation streak, oldest first.
    pub ready: Vec<CandidateCluster>,
    pub discarded: usize,
}

/// Every open candidate cluster.
#[derive(Debug)]
pub struct CandidatePool {
    clusters: Vec<CandidateCluster>,
    next_key: u64,
    metric: DistanceMetric,
    candidate_threshold: f32,
    min_frames_to_confirm: u32,
    max_idle_frames: u32,
    max_age: u32,
    max_samples: usize,
}

impl CandidatePool {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            clusters: Vec::new(),
            next_key: 0,
            metric: config.metric,
            candidate_threshold: config.candidate_threshold,
            min_frames_to_confirm: config.min_frames_to_confirm,
            max_idle_frames: config.candidate_max_idle_frames,
            max_age: config.candidate_max_age(),
            max_samples: config.max_samples,
        }
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CandidateCluster> {
        self.clusters.iter()
    }

    /// Feed this frame's unmatched observations into the pool.
    ///
    /// Each observation joins the closest cluster under the candidate
    /// threshold (one observation per cluster) or opens a new one. Clusters
    /// that reach the confirmation streak are handed back; clusters idle too
    /// long or open too long without promotion are dropped.
    pub(crate) fn update(
        &mut self,
        faces: &[&FaceObservation],
        now: DateTime<Utc>,
    ) -> CandidateTick {
        for cluster in &mut self.clusters {
            cluster.age += 1;
        }

        let keys: Vec<u64> = self.clusters.iter().map(|cluster| cluster.key).collect();
        let mut cost = Array2::from_elem((faces.len(), self.clusters.len()), f32::INFINITY);
        for (i, face) in faces.iter().enumerate() {
            for (j, cluster) in self.clusters.iter().enumerate() {
                cost[[i, j]] = self.metric.distance(&face.embedding, cluster.centroid());
            }
        }
        let row_to_col = greedy_assign(&cost, &keys, self.candidate_threshold);

        let mut fed = vec![false; self.clusters.len()];
        for (face, matched) in faces.iter().zip(&row_to_col) {
            if let Some(j) = matched {
                self.clusters[*j].feed(face, now);
                fed[*j] = true;
            }
        }
        for (cluster, fed) in self.clusters.iter_mut().zip(&fed) {
            if !fed {
                cluster.starve();
            }
        }
        for (face, matched) in faces.iter().zip(&row_to_col) {
            if matched.is_none() {
                let key = self.next_key;
                self.next_key += 1;
                self.clusters
                    .push(CandidateCluster::open(key, self.max_samples, face, now));
            }
        }

        let mut tick = CandidateTick::default();
        let mut open = Vec::with_capacity(self.clusters.len());
        for cluster in self.clusters.drain(..) {
            if cluster.streak >= self.min_frames_to_confirm {
                tick.ready.push(cluster);
            } else if cluster.idle_frames > self.max_idle_frames || cluster.age >= self.max_age {
                tick.discarded += 1;
            } else {
                open.push(cluster);
            }
        }
        self.clusters = open;
        tick
    }
}
