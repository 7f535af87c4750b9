//! Per-frame entry point tying matching, lifecycle, deduplication and analysis
//! together.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::analysis::{AnalysisScheduler, AnalysisSummary, Plugin, PluginResult, PluginStatus};
use crate::config::TrackerConfig;
use crate::error::{StorageError, TrackingError};
use crate::identity::{Identity, IdentityBoxes, IdentityStore, MergeOutcome};
use crate::integration::{IdentityStorage, MemoryStorage};
use crate::tracker::association::associate_regions;
use crate::tracker::detection::{DetectionKind, FaceObservation, Frame};
use crate::tracker::duplicates::{DuplicateResolver, MergeProposal};
use crate::tracker::lifecycle::{LifecycleController, LifecycleEvents};
use crate::tracker::matching::{Matcher, SampleWeighting};

/// An identity matched in the current frame, as shown to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct VisibleIdentity {
    pub id: u64,
    pub display_name: Option<String>,
    pub boxes: IdentityBoxes,
    /// Match confidence in percent.
    pub certainty: Option<f32>,
    pub plugin_results: BTreeMap<String, PluginResult>,
}

impl VisibleIdentity {
    fn from_identity(identity: &Identity) -> Self {
        Self {
            id: identity.id(),
            display_name: identity.display_name().map(str::to_string),
            boxes: identity.boxes().clone(),
            certainty: identity.certainty(),
            plugin_results: identity.plugin_results().clone(),
        }
    }
}

/// Everything that happened while processing one frame.
#[derive(Debug, Clone, Default)]
pub struct FrameReport {
    pub frame_id: u64,
    /// Identities matched this frame, in ascending id order.
    pub visible: Vec<VisibleIdentity>,
    /// Lifecycle transitions of the frame. Identities absorbed by the periodic
    /// duplicate scan are left out.
    pub events: LifecycleEvents,
    /// Face detections ignored because they were malformed.
    pub dropped_detections: usize,
    /// Merges done by the periodic duplicate scan.
    pub merges: Vec<MergeOutcome>,
    pub analysis: AnalysisSummary,
    /// Storage writes that failed: retired identities whose record could not
    /// be written, and merges that could not be mirrored to storage.
    pub persist_failures: usize,
}

pub struct IdentityTracker {
    config: TrackerConfig,
    store: IdentityStore,
    matcher: Matcher,
    lifecycle: LifecycleController,
    resolver: DuplicateResolver,
    scheduler: AnalysisScheduler,
    storage: Box<dyn IdentityStorage>,
    frame_id: u64,
}

impl IdentityTracker {
    /// A tracker backed by in-memory storage.
    pub fn new(config: TrackerConfig) -> Result<Self, TrackingError> {
        Self::with_storage(config, MemoryStorage::new())
    }

    /// A tracker that restores previously persisted identities from `storage`
    /// and writes retired identities back to it.
    pub fn with_storage(
        config: TrackerConfig,
        mut storage: impl IdentityStorage + 'static,
    ) -> Result<Self, TrackingError> {
        config.validate()?;
        let records = storage.load_all()?;
        let store = IdentityStore::from_records(config.max_samples, config.embedding_dim, records);

        Ok(Self {
            matcher: Matcher::new(&config),
            lifecycle: LifecycleController::new(&config),
            resolver: DuplicateResolver::new(&config),
            scheduler: AnalysisScheduler::new(&config.scheduler),
            storage: Box::new(storage),
            store,
            config,
            frame_id: 0,
        })
    }

    /// Replace the default step weighting of match distances.
    pub fn with_weighting(mut self, weighting: impl SampleWeighting + 'static) -> Self {
        self.matcher = Matcher::with_weighting(&self.config, weighting);
        self
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn store(&self) -> &IdentityStore {
        &self.store
    }

    pub fn identity(&self, id: u64) -> Option<&Identity> {
        self.store.get(id)
    }

    /// Number of frames processed so far.
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    /// Open candidate clusters not yet promoted.
    pub fn candidate_count(&self) -> usize {
        self.lifecycle.candidates().len()
    }

    /// Process one frame of detections.
    ///
    /// Malformed detections are skipped and plugin failures are recorded on
    /// the identity; neither fails the frame. An error here means the
    /// tracker's own bookkeeping was violated.
    pub fn process_frame(
        &mut self,
        frame: &Frame,
        now: DateTime<Utc>,
    ) -> Result<FrameReport, TrackingError> {
        self.frame_id += 1;
        self.store.begin_frame();

        let mut dropped_detections = 0;
        let faces: Vec<FaceObservation> = frame
            .detections
            .iter()
            .filter(|detection| detection.kind == DetectionKind::Face)
            .filter_map(|detection| {
                let face = self.matcher.observe(detection);
                if face.is_none() {
                    dropped_detections += 1;
                }
                face
            })
            .collect();

        let assignment = self.matcher.assign(&faces, &self.store);
        self.matcher.absorb(&mut self.store, &faces, &assignment, now)?;
        let mut events = self
            .lifecycle
            .advance(&mut self.store, &self.matcher, &faces, &assignment, now)?;
        let mut persist_failures = self.persist_retired(&events.retired);

        associate_regions(&mut self.store, &frame.detections, self.config.association_threshold);

        let scan_due = self
            .config
            .duplicate_scan_interval
            .is_some_and(|interval| self.frame_id % u64::from(interval) == 0);
        let merges = if scan_due {
            let (merges, failures) = self.merge_duplicates()?;
            persist_failures += failures;
            for merge in &merges {
                events.forget(merge.absorbed);
            }
            merges
        } else {
            Vec::new()
        };

        let analysis = self.scheduler.run(&mut self.store, frame.image.as_ref(), now);

        debug!(
            frame = self.frame_id,
            faces = faces.len(),
            dropped = dropped_detections,
            identities = self.store.len(),
            candidates = self.candidate_count(),
            "Processed frame"
        );

        Ok(FrameReport {
            frame_id: self.frame_id,
            visible: self.visible_identities(),
            events,
            dropped_detections,
            merges,
            analysis,
            persist_failures,
        })
    }

    /// Identities matched in the most recent frame.
    pub fn visible_identities(&self) -> Vec<VisibleIdentity> {
        self.store
            .visible()
            .map(VisibleIdentity::from_identity)
            .collect()
    }

    /// Set or clear the operator-assigned name of an identity.
    pub fn rename(&mut self, id: u64, name: Option<String>) -> Result<(), TrackingError> {
        self.store.set_display_name(id, name)
    }

    /// Remove an identity from the session and its record from storage.
    ///
    /// When storage refuses the delete, the identity stays in the session.
    pub fn delete_identity(&mut self, id: u64) -> Result<Identity, TrackingError> {
        if self.store.get(id).is_none() {
            return Err(TrackingError::UnknownIdentity(id));
        }
        self.storage.remove(id)?;
        let identity = self.store.remove(id)?;
        info!(id, "Deleted identity");
        Ok(identity)
    }

    pub fn find_duplicates(&self) -> Vec<MergeProposal> {
        self.resolver.find_duplicates(&self.store)
    }

    pub fn find_duplicate_groups(&self) -> Vec<Vec<u64>> {
        self.resolver.find_duplicate_groups(&self.store)
    }

    /// Merge every pair of identities closer than the duplicate threshold.
    ///
    /// Storage drops each absorbed record and receives the survivor's merged
    /// one. Storage failures are logged; the merges themselves stand.
    pub fn resolve_duplicates(&mut self) -> Result<Vec<MergeOutcome>, TrackingError> {
        let (merges, _) = self.merge_duplicates()?;
        Ok(merges)
    }

    /// Merge two identities chosen by the operator, keeping `survivor`.
    ///
    /// Storage is updated the same way as for [`Self::resolve_duplicates`].
    pub fn merge_identities(
        &mut self,
        survivor: u64,
        absorbed: u64,
    ) -> Result<MergeOutcome, TrackingError> {
        let outcome = self.store.merge(survivor, absorbed)?;
        self.mirror_merge(&outcome);
        Ok(outcome)
    }

    /// Register an analysis plugin; a plugin with the same name is replaced.
    pub fn register_plugin(&mut self, plugin: impl Plugin + 'static) {
        self.scheduler.registry_mut().register(Arc::new(plugin));
    }

    /// Remove a plugin and forget every result it produced.
    pub fn unregister_plugin(&mut self, name: &str) -> bool {
        let removed = self.scheduler.registry_mut().unregister(name);
        if removed {
            self.store.forget_plugin(name);
        }
        removed
    }

    pub fn enable_plugin(&mut self, name: &str) -> bool {
        self.scheduler.registry_mut().enable(name)
    }

    pub fn disable_plugin(&mut self, name: &str) -> bool {
        self.scheduler.registry_mut().disable(name)
    }

    pub fn plugin_status(&self) -> Vec<PluginStatus> {
        self.scheduler.registry().status()
    }

    pub fn scheduler(&self) -> &AnalysisScheduler {
        &self.scheduler
    }

    pub fn results_for_identity(&self, id: u64) -> Option<&BTreeMap<String, PluginResult>> {
        self.store.results_for_identity(id)
    }

    pub fn results_for_plugin(&self, name: &str) -> BTreeMap<u64, PluginResult> {
        self.store.results_for_plugin(name)
    }

    /// Drop plugin results older than `max_age`.
    pub fn clear_stale_results(&mut self, max_age: chrono::Duration, now: DateTime<Utc>) -> usize {
        self.store.clear_stale_results(max_age, now)
    }

    /// Wait up to `timeout` for background plugin jobs and record their
    /// results.
    pub fn flush_analysis(&mut self, timeout: Duration) -> AnalysisSummary {
        self.scheduler.flush(&mut self.store, timeout)
    }

    /// Write every identity still in the store to storage, e.g. at shutdown.
    pub fn persist_all(&mut self) -> Result<usize, StorageError> {
        let mut written = 0;
        for identity in self.store.iter() {
            self.storage.persist(&identity.to_record())?;
            written += 1;
        }
        info!(count = written, "Persisted identities");
        Ok(written)
    }

    /// Drop retired identities still held in memory, giving up on writing
    /// them. Only identities whose record could not be written at retirement
    /// are left; [`Self::persist_all`] retries those.
    pub fn purge_retired(&mut self) -> Vec<Identity> {
        self.store.purge_retired()
    }

    /// Write each retired identity and drop it from memory once written.
    fn persist_retired(&mut self, retired: &[u64]) -> usize {
        let mut failures = 0;
        for &id in retired {
            let Some(identity) = self.store.get(id) else {
                continue;
            };
            let record = identity.to_record();
            match self.storage.persist(&record) {
                Ok(()) => {
                    if self.store.remove(id).is_ok() {
                        debug!(id, "Dropped retired identity from memory");
                    }
                }
                Err(err) => {
                    error!(
                        id,
                        error = %err,
                        "Failed to persist retired identity, keeping it in memory"
                    );
                    failures += 1;
                }
            }
        }
        failures
    }

    /// Run the duplicate resolver and mirror its merges to storage. Returns
    /// the merges and the number of merges storage failed to take.
    fn merge_duplicates(&mut self) -> Result<(Vec<MergeOutcome>, usize), TrackingError> {
        let merges = self.resolver.resolve(&mut self.store)?;
        let mut failures = 0;
        for merge in &merges {
            if !self.mirror_merge(merge) {
                failures += 1;
            }
        }
        Ok((merges, failures))
    }

    fn mirror_merge(&mut self, merge: &MergeOutcome) -> bool {
        match self.write_merge(merge) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    survivor = merge.survivor,
                    absorbed = merge.absorbed,
                    error = %err,
                    "Failed to mirror merge to storage"
                );
                false
            }
        }
    }

    fn write_merge(&mut self, merge: &MergeOutcome) -> Result<(), StorageError> {
        self.storage.remove(merge.absorbed)?;
        if let Some(survivor) = self.store.get(merge.survivor) {
            self.storage.persist(&survivor.to_record())?;
        }
        Ok(())
    }
}
