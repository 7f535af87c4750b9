//! Detecting and merging identities that describe the same person.

use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use crate::config::{DistanceMetric, TrackerConfig};
use crate::error::TrackingError;
use crate::identity::{Identity, IdentityStore, MergeOutcome};

/// Two identities whose representatives are close enough to be one person.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeProposal {
    /// The lower of the two ids.
    pub survivor: u64,
    pub absorbed: u64,
    pub distance: f32,
}

/// Pairwise scan over every non-retired identity.
#[derive(Debug, Clone)]
pub struct DuplicateResolver {
    threshold: f32,
    metric: DistanceMetric,
}

impl DuplicateResolver {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            threshold: config.duplicate_threshold,
            metric: config.metric,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Every pair under the duplicate threshold, closest first.
    pub fn find_duplicates(&self, store: &IdentityStore) -> Vec<MergeProposal> {
        let identities: Vec<&Identity> = store.matchable().collect();

        let mut proposals = Vec::new();
        for (i, a) in identities.iter().enumerate() {
            for b in &identities[i + 1..] {
                let distance = self.metric.distance(a.representative(), b.representative());
                if distance < self.threshold {
                    proposals.push(MergeProposal {
                        survivor: a.id().min(b.id()),
                        absorbed: a.id().max(b.id()),
                        distance,
                    });
                }
            }
        }
        proposals.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then(a.survivor.cmp(&b.survivor))
                .then(a.absorbed.cmp(&b.absorbed))
        });
        proposals
    }

    /// Merge every duplicate pair found by one scan.
    ///
    /// Proposals are applied closest first. Once an identity has been
    /// absorbed, later proposals that mention it are skipped; the next scan
    /// compares against the merged survivor instead.
    pub fn resolve(&self, store: &mut IdentityStore) -> Result<Vec<MergeOutcome>, TrackingError> {
        let mut absorbed = HashSet::new();
        let mut outcomes = Vec::new();

        for proposal in self.find_duplicates(store) {
            if absorbed.contains(&proposal.survivor) || absorbed.contains(&proposal.absorbed) {
                debug!(
                    survivor = proposal.survivor,
                    absorbed = proposal.absorbed,
                    "Skipping proposal for an already merged identity"
                );
                continue;
            }
            let mut outcome = store.merge(proposal.survivor, proposal.absorbed)?;
            outcome.distance = Some(proposal.distance);
            absorbed.insert(proposal.absorbed);
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Connected groups of likely duplicates, each sorted by id, groups
    /// ordered by their smallest id.
    pub fn find_duplicate_groups(&self, store: &IdentityStore) -> Vec<Vec<u64>> {
        let mut parent: BTreeMap<u64, u64> = BTreeMap::new();

        fn root(parent: &mut BTreeMap<u64, u64>, id: u64) -> u64 {
            let mut current = id;
            while let Some(&next) = parent.get(&current) {
                if next == current {
                    break;
                }
                current = next;
            }
            parent.insert(id, current);
            current
        }

        for proposal in self.find_duplicates(store) {
            parent.entry(proposal.survivor).or_insert(proposal.survivor);
            parent.entry(proposal.absorbed).or_insert(proposal.absorbed);
            let a = root(&mut parent, proposal.survivor);
            let b = root(&mut parent, proposal.absorbed);
            if a != b {
                parent.insert(a.max(b), a.min(b));
            }
        }

        let ids: Vec<u64> = parent.keys().copied().collect();
        let mut groups: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
        for id in ids {
            let group = root(&mut parent, id);
            groups.entry(group).or_default().push(id);
        }
        groups.into_values().collect()
    }
}
