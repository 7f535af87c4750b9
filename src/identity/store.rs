//! Ordered collection of tracked identities.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::analysis::PluginResult;
use crate::error::TrackingError;
use crate::identity::record::{Identity, IdentityRecord, MergeConflict};
use crate::identity::samples::{Sample, SampleBuffer};
use crate::identity::state::IdentityState;
use crate::tracker::Rect;

/// Result of merging one identity into another.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub survivor: u64,
    pub absorbed: u64,
    /// Representative distance that triggered the merge, if it came from the
    /// duplicate resolver.
    pub distance: Option<f32>,
    pub conflict: Option<MergeConflict>,
}

/// Owns every identity of the session, keyed by id.
///
/// Ids are allocated monotonically and never handed out twice, not even after
/// the identity holding one was merged away or deleted.
#[derive(Debug)]
pub struct IdentityStore {
    identities: BTreeMap<u64, Identity>,
    next_id: u64,
    max_samples: usize,
    embedding_dim: usize,
}

impl IdentityStore {
    pub fn new(max_samples: usize, embedding_dim: usize) -> Self {
        Self {
            identities: BTreeMap::new(),
            next_id: 1,
            max_samples,
            embedding_dim,
        }
    }

    /// Pre-populate the store from persisted records.
    ///
    /// Records without usable embeddings are skipped. Id allocation resumes
    /// after the highest id seen, skipped records included.
    pub fn from_records(
        max_samples: usize,
        embedding_dim: usize,
        records: impl IntoIterator<Item = IdentityRecord>,
    ) -> Self {
        let mut store = Self::new(max_samples, embedding_dim);
        for mut record in records {
            store.next_id = store.next_id.max(record.id.saturating_add(1));

            record
                .samples
                .retain(|sample| sample.embedding.len() == embedding_dim);
            if record.samples.is_empty() {
                debug!(id = record.id, "Skipping stored identity without usable embeddings");
                continue;
            }
            if store.identities.contains_key(&record.id) {
                warn!(id = record.id, "Duplicate stored identity id, keeping the first");
                continue;
            }

            store
                .identities
                .insert(record.id, Identity::from_record(record, max_samples));
        }
        if !store.identities.is_empty() {
            info!(count = store.identities.len(), "Loaded previously tracked identities");
        }
        store
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn max_samples(&self) -> usize {
        self.max_samples
    }

    /// The id the next promoted identity will receive.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn get(&self, id: u64) -> Option<&Identity> {
        self.identities.get(&id)
    }

    /// All identities, retired ones included, in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &Identity> {
        self.identities.values()
    }

    /// Confirmed and lost identities, in ascending id order.
    pub fn matchable(&self) -> impl Iterator<Item = &Identity> {
        self.iter().filter(|identity| identity.state().is_matchable())
    }

    /// Identities matched in the current frame, in ascending id order.
    pub fn visible(&self) -> impl Iterator<Item = &Identity> {
        self.iter().filter(|identity| identity.is_visible())
    }

    /// Mutable access to a non-retired identity.
    pub(crate) fn active_mut(&mut self, id: u64) -> Result<&mut Identity, TrackingError> {
        let identity = self
            .identities
            .get_mut(&id)
            .ok_or(TrackingError::UnknownIdentity(id))?;
        if identity.state().is_retired() {
            return Err(TrackingError::RetiredIdentity(id));
        }
        Ok(identity)
    }

    pub(crate) fn matchable_ids(&self) -> Vec<u64> {
        self.matchable().map(Identity::id).collect()
    }

    pub(crate) fn begin_frame(&mut self) {
        for identity in self.identities.values_mut() {
            if !identity.state().is_retired() {
                identity.begin_frame();
            }
        }
    }

    /// Create a confirmed identity seeded with a candidate cluster's samples.
    pub(crate) fn create(
        &mut self,
        samples: Vec<Sample>,
        sample_count: u64,
        face: Rect,
        now: DateTime<Utc>,
    ) -> Result<u64, TrackingError> {
        for sample in &samples {
            self.check_dimension(sample)?;
        }

        let id = self.next_id;
        self.next_id += 1;

        let mut identity = Identity::new(
            id,
            SampleBuffer::from_samples(self.max_samples, samples),
            sample_count,
            now,
        );
        identity.set_face_box(face);
        self.identities.insert(id, identity);
        Ok(id)
    }

    /// Append a matched sample to an identity and mark it visible.
    pub(crate) fn observe(
        &mut self,
        id: u64,
        sample: Sample,
        face: Rect,
        distance: f32,
    ) -> Result<(), TrackingError> {
        self.check_dimension(&sample)?;
        self.active_mut(id)?.observe(sample, face, Some(distance));
        Ok(())
    }

    /// Fold a candidate cluster into an existing identity.
    pub(crate) fn observe_many(
        &mut self,
        id: u64,
        samples: Vec<Sample>,
        face: Rect,
        distance: f32,
    ) -> Result<(), TrackingError> {
        for sample in &samples {
            self.check_dimension(sample)?;
        }
        self.active_mut(id)?.observe_many(samples, face, distance);
        Ok(())
    }

    /// Set or clear the operator-assigned name.
    pub fn set_display_name(&mut self, id: u64, name: Option<String>) -> Result<(), TrackingError> {
        let identity = self.active_mut(id)?;
        identity.set_display_name(name);
        info!(id, name = ?identity.display_name(), "Updated identity name");
        Ok(())
    }

    /// Remove an identity outright, whatever its state.
    pub fn remove(&mut self, id: u64) -> Result<Identity, TrackingError> {
        self.identities
            .remove(&id)
            .ok_or(TrackingError::UnknownIdentity(id))
    }

    /// Drop retired identities from memory, returning them.
    pub fn purge_retired(&mut self) -> Vec<Identity> {
        let retired: Vec<u64> = self
            .iter()
            .filter(|identity| identity.state().is_retired())
            .map(Identity::id)
            .collect();
        retired
            .into_iter()
            .filter_map(|id| self.identities.remove(&id))
            .collect()
    }

    /// Merge `absorbed` into `survivor` and remove `absorbed` from the store.
    ///
    /// Both identities must exist and be non-retired. The merge cannot be
    /// undone.
    pub fn merge(&mut self, survivor: u64, absorbed: u64) -> Result<MergeOutcome, TrackingError> {
        if survivor == absorbed {
            return Err(TrackingError::SelfMerge(survivor));
        }
        self.active_mut(survivor)?;
        self.active_mut(absorbed)?;

        let other = self.remove(absorbed)?;
        let keeper = self.active_mut(survivor)?;
        let conflict = keeper.absorb(other);

        if let Some(conflict) = &conflict {
            warn!(
                survivor,
                absorbed,
                kept = %conflict.kept_name,
                discarded = %conflict.discarded_name,
                "Merged identities carried different names, keeping the survivor's"
            );
        }
        info!(survivor, absorbed, samples = keeper.samples().len(), "Merged duplicate identity");

        Ok(MergeOutcome {
            survivor,
            absorbed,
            distance: None,
            conflict,
        })
    }

    /// Write a plugin outcome. Only the plugin fields of the identity are
    /// touched; returns `false` when the identity is gone or retired.
    pub(crate) fn record_plugin_result(
        &mut self,
        id: u64,
        plugin: &str,
        result: PluginResult,
        ran_at: Option<DateTime<Utc>>,
    ) -> bool {
        match self.identities.get_mut(&id) {
            Some(identity) if identity.state() != IdentityState::Retired => {
                identity.record_plugin_result(plugin, result, ran_at);
                true
            }
            _ => false,
        }
    }

    /// Latest result of every plugin for one identity.
    pub fn results_for_identity(&self, id: u64) -> Option<&BTreeMap<String, PluginResult>> {
        self.get(id).map(Identity::plugin_results)
    }

    /// Latest result of one plugin across all identities.
    pub fn results_for_plugin(&self, plugin: &str) -> BTreeMap<u64, PluginResult> {
        self.iter()
            .filter_map(|identity| {
                identity
                    .plugin_results()
                    .get(plugin)
                    .map(|result| (identity.id(), result.clone()))
            })
            .collect()
    }

    /// Forget every result and run timestamp of a plugin.
    pub(crate) fn forget_plugin(&mut self, plugin: &str) {
        for identity in self.identities.values_mut() {
            if !identity.state().is_retired() {
                identity.forget_plugin(plugin);
            }
        }
    }

    /// Drop results older than `max_age`. Returns how many were removed.
    pub fn clear_stale_results(&mut self, max_age: chrono::Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now - max_age;
        self.identities
            .values_mut()
            .filter(|identity| !identity.state().is_retired())
            .map(|identity| identity.retain_results_since(cutoff))
            .sum()
    }

    fn check_dimension(&self, sample: &Sample) -> Result<(), TrackingError> {
        if sample.embedding.len() != self.embedding_dim {
            return Err(TrackingError::DimensionMismatch {
                expected: self.embedding_dim,
                got: sample.embedding.len(),
            });
        }
        Ok(())
    }
}
