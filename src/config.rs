//! Tracker configuration.
//!
//! The configuration is built once at start-up, validated, and handed to the
//! matcher, lifecycle controller and scheduler by value. Loading it from a file
//! is left to the caller; every struct here derives serde traits for that.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Distance function used to compare face embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// L2 distance between the raw vectors.
    #[default]
    Euclidean,
    /// `1 - cosine similarity`.
    Cosine,
}

/// Parameters of the default step-shaped sample-count weighting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightingConfig {
    /// Identities with at least this many samples get the bonus.
    pub bonus_min_samples: u64,
    /// Multiplier applied to the distance of well-sampled identities.
    pub bonus_factor: f32,
    /// Identities with at most this many samples get the penalty.
    pub penalty_max_samples: u64,
    /// Multiplier applied to the distance of sparsely sampled identities.
    pub penalty_factor: f32,
}

impl Default for WeightingConfig {
    fn default() -> Self {
        Self {
            bonus_min_samples: 3,
            bonus_factor: 0.95,
            penalty_max_samples: 1,
            penalty_factor: 1.05,
        }
    }
}

/// Analysis scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of background plugin jobs running at once.
    pub worker_threads: usize,
    /// Background jobs running longer than this are recorded as failures.
    #[serde(with = "duration_millis")]
    pub plugin_deadline: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            plugin_deadline: Duration::from_secs(10),
        }
    }
}

/// Configuration for the [`IdentityTracker`](crate::tracker::IdentityTracker).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Adjusted distance below which a detection is a confident match.
    pub match_threshold: f32,
    /// Looser distance used for candidate clustering.
    pub candidate_threshold: f32,
    /// Representative distance below which two identities are duplicates.
    pub duplicate_threshold: f32,
    /// Consecutive frames a candidate cluster needs before promotion.
    pub min_frames_to_confirm: u32,
    /// Unmatched frames tolerated before an identity is retired.
    pub max_missed_frames: u32,
    /// Capacity of each identity's embedding ring buffer.
    pub max_samples: usize,
    /// Dimensionality every face embedding must have.
    pub embedding_dim: usize,
    /// Unfed frames a candidate cluster survives before being discarded.
    pub candidate_max_idle_frames: u32,
    pub metric: DistanceMetric,
    pub weighting: WeightingConfig,
    /// Minimum face-in-body containment for body/pose association.
    pub association_threshold: f32,
    /// Run the duplicate resolver automatically every N frames.
    pub duplicate_scan_interval: Option<u32>,
    pub scheduler: SchedulerConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            match_threshold: 0.5,
            candidate_threshold: 0.6,
            duplicate_threshold: 0.3,
            min_frames_to_confirm: 5,
            max_missed_frames: 50,
            max_samples: 50,
            embedding_dim: 128,
            candidate_max_idle_frames: 2,
            metric: DistanceMetric::Euclidean,
            weighting: WeightingConfig::default(),
            association_threshold: 0.5,
            duplicate_scan_interval: None,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl TrackerConfig {
    /// Check that the values can drive a tracker.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("match_threshold", self.match_threshold),
            ("candidate_threshold", self.candidate_threshold),
            ("duplicate_threshold", self.duplicate_threshold),
            ("association_threshold", self.association_threshold),
            ("weighting.bonus_factor", self.weighting.bonus_factor),
            ("weighting.penalty_factor", self.weighting.penalty_factor),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::InvalidThreshold { name, value });
            }
        }

        if !(self.duplicate_threshold < self.match_threshold
            && self.match_threshold <= self.candidate_threshold)
        {
            return Err(ConfigError::ThresholdOrder {
                duplicate: self.duplicate_threshold,
                matching: self.match_threshold,
                candidate: self.candidate_threshold,
            });
        }

        if self.min_frames_to_confirm == 0 {
            return Err(ConfigError::Zero("min_frames_to_confirm"));
        }
        if self.max_samples == 0 {
            return Err(ConfigError::Zero("max_samples"));
        }
        if self.embedding_dim == 0 {
            return Err(ConfigError::Zero("embedding_dim"));
        }
        if self.scheduler.worker_threads == 0 {
            return Err(ConfigError::Zero("scheduler.worker_threads"));
        }
        if self.duplicate_scan_interval == Some(0) {
            return Err(ConfigError::Zero("duplicate_scan_interval"));
        }

        Ok(())
    }

    /// Candidate clusters older than this many frames are discarded.
    pub fn candidate_max_age(&self) -> u32 {
        self.min_frames_to_confirm.saturating_mul(2)
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
