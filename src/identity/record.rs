//! The tracked-person record and its read-only projections.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::analysis::PluginResult;
use crate::identity::samples::{Sample, SampleBuffer};
use crate::identity::state::IdentityState;
use crate::tracker::{Keypoint, Rect};

/// Geometry attached to an identity for the current frame only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentityBoxes {
    pub face: Option<Rect>,
    pub body: Option<Rect>,
    pub pose: Option<Rect>,
    pub keypoints: Vec<Keypoint>,
}

/// Read-only view of an identity handed to plugins.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentitySnapshot {
    pub id: u64,
    pub display_name: Option<String>,
    pub plugin_results: BTreeMap<String, PluginResult>,
}

/// Persistable projection of an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: u64,
    pub display_name: Option<String>,
    pub samples: Vec<Sample>,
    pub sample_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    #[serde(default)]
    pub plugin_results: BTreeMap<String, PluginResult>,
}

/// Two merged identities carried different operator-assigned names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeConflict {
    pub kept_name: String,
    pub discarded_name: String,
}

/// A persistent record representing one tracked person across frames.
#[derive(Debug, Clone)]
pub struct Identity {
    id: u64,
    display_name: Option<String>,
    samples: SampleBuffer,
    sample_count: u64,
    state: IdentityState,
    missed_frames: u32,
    created_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    is_visible: bool,
    boxes: IdentityBoxes,
    last_match_distance: Option<f32>,
    plugin_results: BTreeMap<String, PluginResult>,
    plugin_last_run: BTreeMap<String, DateTime<Utc>>,
}

impl Identity {
    /// A freshly promoted identity, visible in the frame that created it.
    pub(crate) fn new(
        id: u64,
        samples: SampleBuffer,
        sample_count: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            display_name: None,
            samples,
            sample_count,
            state: IdentityState::Confirmed,
            missed_frames: 0,
            created_at: now,
            last_seen_at: now,
            is_visible: true,
            boxes: IdentityBoxes::default(),
            last_match_distance: None,
            plugin_results: BTreeMap::new(),
            plugin_last_run: BTreeMap::new(),
        }
    }

    /// Restore an identity loaded from storage. It starts out lost.
    pub(crate) fn from_record(record: IdentityRecord, max_samples: usize) -> Self {
        let samples = SampleBuffer::from_samples(max_samples, record.samples);
        Self {
            id: record.id,
            display_name: record.display_name,
            sample_count: record.sample_count.max(samples.len() as u64),
            samples,
            state: IdentityState::Lost,
            missed_frames: 0,
            created_at: record.created_at,
            last_seen_at: record.last_seen_at,
            is_visible: false,
            boxes: IdentityBoxes::default(),
            last_match_distance: None,
            plugin_results: record.plugin_results,
            plugin_last_run: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn state(&self) -> IdentityState {
        self.state
    }

    pub fn is_visible(&self) -> bool {
        self.is_visible
    }

    pub fn missed_frames(&self) -> u32 {
        self.missed_frames
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn samples(&self) -> &SampleBuffer {
        &self.samples
    }

    /// Centroid of the retained embeddings, used for matching and duplicate
    /// comparison.
    pub fn representative(&self) -> &Array1<f32> {
        self.samples.centroid()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_seen_at(&self) -> DateTime<Utc> {
        self.last_seen_at
    }

    pub fn boxes(&self) -> &IdentityBoxes {
        &self.boxes
    }

    /// Weighted distance of this frame's match, if the identity was matched.
    pub fn last_match_distance(&self) -> Option<f32> {
        self.last_match_distance
    }

    /// Match confidence as a percentage, derived from the weighted distance.
    pub fn certainty(&self) -> Option<f32> {
        self.last_match_distance
            .map(|distance| ((1.0 - distance) * 100.0).clamp(0.0, 100.0))
    }

    pub fn plugin_results(&self) -> &BTreeMap<String, PluginResult> {
        &self.plugin_results
    }

    pub fn plugin_last_run(&self) -> &BTreeMap<String, DateTime<Utc>> {
        &self.plugin_last_run
    }

    pub fn snapshot(&self) -> IdentitySnapshot {
        IdentitySnapshot {
            id: self.id,
            display_name: self.display_name.clone(),
            plugin_results: self.plugin_results.clone(),
        }
    }

    pub fn to_record(&self) -> IdentityRecord {
        IdentityRecord {
            id: self.id,
            display_name: self.display_name.clone(),
            samples: self.samples.iter().cloned().collect(),
            sample_count: self.sample_count,
            created_at: self.created_at,
            last_seen_at: self.last_seen_at,
            plugin_results: self.plugin_results.clone(),
        }
    }

    pub(crate) fn set_display_name(&mut self, name: Option<String>) {
        self.display_name = name;
    }

    /// Clear per-frame data ahead of a new frame.
    pub(crate) fn begin_frame(&mut self) {
        self.is_visible = false;
        self.boxes = IdentityBoxes::default();
        self.last_match_distance = None;
    }

    /// Record a matched face detection for this frame.
    pub(crate) fn observe(&mut self, sample: Sample, face: Rect, distance: Option<f32>) {
        self.samples.push(sample);
        self.sample_count += 1;
        self.is_visible = true;
        self.boxes.face = Some(face);
        self.last_match_distance = distance;
    }

    /// Fold a whole candidate cluster into this identity.
    pub(crate) fn observe_many(&mut self, samples: Vec<Sample>, face: Rect, distance: f32) {
        self.sample_count += samples.len() as u64;
        self.samples.merge(samples);
        self.is_visible = true;
        self.boxes.face = Some(face);
        self.last_match_distance = Some(distance);
    }

    pub(crate) fn set_face_box(&mut self, face: Rect) {
        self.boxes.face = Some(face);
    }

    pub(crate) fn set_body_box(&mut self, body: Rect) {
        self.boxes.body = Some(body);
    }

    pub(crate) fn set_pose(&mut self, pose: Rect, keypoints: Vec<Keypoint>) {
        self.boxes.pose = Some(pose);
        self.boxes.keypoints = keypoints;
    }

    /// Matched this frame: back to confirmed with counters reset.
    /// Returns `true` when this was a re-identification of a lost identity.
    pub(crate) fn mark_matched(&mut self, now: DateTime<Utc>) -> bool {
        let recovered = self.state == IdentityState::Lost;
        self.state = IdentityState::Confirmed;
        self.missed_frames = 0;
        self.last_seen_at = now;
        recovered
    }

    /// Not matched this frame. Returns the state after the miss.
    pub(crate) fn mark_missed(&mut self, max_missed_frames: u32) -> IdentityState {
        self.missed_frames += 1;
        self.is_visible = false;
        self.state = if self.missed_frames > max_missed_frames {
            IdentityState::Retired
        } else {
            IdentityState::Lost
        };
        self.state
    }

    pub(crate) fn record_plugin_result(
        &mut self,
        plugin: &str,
        result: PluginResult,
        ran_at: Option<DateTime<Utc>>,
    ) {
        if let Some(ran_at) = ran_at {
            self.plugin_last_run.insert(plugin.to_string(), ran_at);
        }
        self.plugin_results.insert(plugin.to_string(), result);
    }

    pub(crate) fn forget_plugin(&mut self, plugin: &str) {
        self.plugin_results.remove(plugin);
        self.plugin_last_run.remove(plugin);
    }

    /// Drop results produced before `cutoff`. Returns how many were removed.
    pub(crate) fn retain_results_since(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.plugin_results.len();
        self.plugin_results
            .retain(|_, result| result.produced_at >= cutoff);
        before - self.plugin_results.len()
    }

    /// Absorb a duplicate identity into this one.
    pub(crate) fn absorb(&mut self, other: Identity) -> Option<MergeConflict> {
        let conflict = match (&self.display_name, other.display_name) {
            (Some(kept), Some(discarded)) if *kept != discarded => Some(MergeConflict {
                kept_name: kept.clone(),
                discarded_name: discarded,
            }),
            (None, Some(name)) => {
                self.display_name = Some(name);
                None
            }
            _ => None,
        };

        self.samples.merge(other.samples.into_samples());
        self.sample_count += other.sample_count;

        for (plugin, result) in other.plugin_results {
            let newer = self
                .plugin_results
                .get(&plugin)
                .is_none_or(|current| result.produced_at > current.produced_at);
            if newer {
                self.plugin_results.insert(plugin, result);
            }
        }
        for (plugin, ran_at) in other.plugin_last_run {
            let entry = self.plugin_last_run.entry(plugin).or_insert(ran_at);
            if ran_at > *entry {
                *entry = ran_at;
            }
        }

        if other.is_visible && !self.is_visible {
            self.is_visible = true;
            self.boxes = other.boxes;
            self.last_match_distance = other.last_match_distance;
        }
        if other.state == IdentityState::Confirmed {
            self.state = IdentityState::Confirmed;
        }
        self.missed_frames = self.missed_frames.min(other.missed_frames);
        self.created_at = self.created_at.min(other.created_at);
        self.last_seen_at = self.last_seen_at.max(other.last_seen_at);

        conflict
    }
}
