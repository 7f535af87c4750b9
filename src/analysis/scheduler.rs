//! Deciding which plugin runs for which identity, and recording the outcome.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use image::RgbImage;
use serde_json::Value;
use tracing::{debug, warn};

use crate::analysis::crop::{Crop, CropCache};
use crate::analysis::plugin::{Execution, Plugin, PluginResult, invoke_isolated};
use crate::analysis::registry::PluginRegistry;
use crate::analysis::worker_pool::{Completion, Job, WorkerPool};
use crate::config::SchedulerConfig;
use crate::error::PluginError;
use crate::identity::{Identity, IdentitySnapshot, IdentityStore};

/// Counts of what one scheduler tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalysisSummary {
    /// Inline invocations run this tick.
    pub invoked: usize,
    /// Inline and background outcomes recorded as successes.
    pub succeeded: usize,
    /// Inline and background outcomes recorded as failures.
    pub failed: usize,
    /// Background jobs handed to the worker pool.
    pub dispatched: usize,
    /// Due background jobs held back because every worker was busy.
    pub deferred: usize,
}

struct DueWork {
    identity: IdentitySnapshot,
    plugin: Arc<dyn Plugin>,
    crop: Arc<Crop>,
}

/// Runs due plugins against visible identities.
///
/// A plugin is due for an identity when it has never run for it or its
/// interval has elapsed since the last run. Errors and panics do not count as
/// a run, so a failing pair is retried on the next tick. A background call
/// that hit its deadline does count, so a hung plugin waits out its interval
/// instead of taking a worker on every tick.
pub struct AnalysisScheduler {
    registry: PluginRegistry,
    pool: WorkerPool,
    in_flight: HashSet<(u64, String)>,
}

impl AnalysisScheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            registry: PluginRegistry::new(),
            pool: WorkerPool::new(config),
            in_flight: HashSet::new(),
        }
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut PluginRegistry {
        &mut self.registry
    }

    /// Background jobs dispatched but not yet drained.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, identity: u64, plugin: &str) -> bool {
        self.in_flight.contains(&(identity, plugin.to_string()))
    }

    /// One tick: drain finished background jobs, then run or dispatch every
    /// due (identity, plugin) pair that has a crop this frame.
    pub(crate) fn run(
        &mut self,
        store: &mut IdentityStore,
        frame: Option<&RgbImage>,
        now: DateTime<Utc>,
    ) -> AnalysisSummary {
        let mut summary = AnalysisSummary::default();
        while let Some(completion) = self.pool.try_recv() {
            self.apply_completion(store, completion, &mut summary);
        }

        let Some(frame) = frame else {
            return summary;
        };
        if self.registry.is_empty() {
            return summary;
        }

        for work in self.collect_due(store, frame, now) {
            let name = work.plugin.name().to_string();
            let id = work.identity.id;
            match work.plugin.execution() {
                Execution::Inline => {
                    summary.invoked += 1;
                    let result =
                        invoke_isolated(work.plugin.as_ref(), &work.crop, &work.identity);
                    record(store, id, &name, result, now, &mut summary);
                }
                Execution::Background => {
                    let job = Job {
                        identity: work.identity,
                        plugin: work.plugin,
                        crop: work.crop,
                        dispatched_at: now,
                    };
                    if self.pool.try_dispatch(job) {
                        summary.dispatched += 1;
                        self.in_flight.insert((id, name));
                    } else {
                        debug!(id, plugin = %name, "No free analysis worker, deferring");
                        summary.deferred += 1;
                    }
                }
            }
        }
        summary
    }

    /// Wait for in-flight background jobs, at most `timeout` in total.
    pub(crate) fn flush(
        &mut self,
        store: &mut IdentityStore,
        timeout: Duration,
    ) -> AnalysisSummary {
        let mut summary = AnalysisSummary::default();
        let deadline = Instant::now() + timeout;
        while !self.in_flight.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.pool.recv_timeout(remaining) {
                Some(completion) => self.apply_completion(store, completion, &mut summary),
                None => break,
            }
        }
        summary
    }

    fn collect_due(
        &self,
        store: &IdentityStore,
        frame: &RgbImage,
        now: DateTime<Utc>,
    ) -> Vec<DueWork> {
        let mut crops = CropCache::new(frame);
        let mut due = Vec::new();

        for identity in store.visible() {
            let mut snapshot = None;
            for plugin in self.registry.enabled() {
                if !is_due(identity, plugin.as_ref(), now) {
                    continue;
                }
                if plugin.execution() == Execution::Background
                    && self.is_in_flight(identity.id(), plugin.name())
                {
                    continue;
                }
                let Some(crop) = crops.get(identity, plugin.input_kind()) else {
                    continue;
                };
                let snapshot = snapshot.get_or_insert_with(|| identity.snapshot());
                due.push(DueWork {
                    identity: snapshot.clone(),
                    plugin: Arc::clone(plugin),
                    crop,
                });
            }
        }
        due
    }

    fn apply_completion(
        &mut self,
        store: &mut IdentityStore,
        completion: Completion,
        summary: &mut AnalysisSummary,
    ) {
        let Completion {
            identity,
            plugin,
            dispatched_at,
            result,
        } = completion;
        self.in_flight.remove(&(identity, plugin.clone()));

        if !self.registry.contains(&plugin) {
            debug!(id = identity, plugin = %plugin, "Dropping result of unregistered plugin");
            return;
        }
        record(store, identity, &plugin, result, dispatched_at, summary);
    }
}

fn is_due(identity: &Identity, plugin: &dyn Plugin, now: DateTime<Utc>) -> bool {
    match identity.plugin_last_run().get(plugin.name()) {
        None => true,
        Some(last) => (now - *last)
            .to_std()
            .is_ok_and(|elapsed| elapsed >= plugin.interval()),
    }
}

fn record(
    store: &mut IdentityStore,
    id: u64,
    plugin: &str,
    result: Result<Value, PluginError>,
    at: DateTime<Utc>,
    summary: &mut AnalysisSummary,
) {
    let succeeded = result.is_ok();
    if let Err(err) = &result {
        warn!(id, plugin, error = %err, "Analysis plugin failed");
    }

    let ran_at = match &result {
        Ok(_) | Err(PluginError::Timeout(_)) => Some(at),
        Err(_) => None,
    };
    let result = PluginResult::from_invocation(result, at);
    if !store.record_plugin_result(id, plugin, result, ran_at) {
        debug!(id, plugin, "Identity gone before its result arrived");
        return;
    }
    if succeeded {
        summary.succeeded += 1;
    } else {
        summary.failed += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::plugin::{FnPlugin, InputKind, PluginOutcome};
    use crate::identity::Sample;
    use crate::tracker::Rect;
    use chrono::TimeZone;
    use ndarray::array;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn t(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    fn store_with_visible() -> IdentityStore {
        let mut store = IdentityStore::new(5, 2);
        store
            .create(
                vec![Sample::new(array![1.0, 0.0], t(0))],
                1,
                Rect::new(2.0, 2.0, 4.0, 4.0),
                t(0),
            )
            .unwrap();
        store
    }

    fn scheduler() -> AnalysisScheduler {
        AnalysisScheduler::new(&SchedulerConfig::default())
    }

    #[test]
    fn test_interval_gates_invocations() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut scheduler = scheduler();
        scheduler.registry_mut().register(Arc::new(FnPlugin::new(
            "count",
            InputKind::Face,
            Duration::from_secs(2),
            move |_, _| Ok(json!(counter.fetch_add(1, Ordering::SeqCst))),
        )));
        let mut store = store_with_visible();
        let frame = RgbImage::new(16, 16);

        for second in 0..5 {
            scheduler.run(&mut store, Some(&frame), t(second));
        }
        // Runs at 0, 2 and 4.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.get(1).unwrap().plugin_last_run().get("count"), Some(&t(4)));
    }

    #[test]
    fn test_failure_is_recorded_and_retried() {
        let mut scheduler = scheduler();
        scheduler.registry_mut().register(Arc::new(FnPlugin::new(
            "broken",
            InputKind::Face,
            Duration::from_secs(60),
            |_, _| -> Result<Value, PluginError> { Err(PluginError::failed("no model")) },
        )));
        let mut store = store_with_visible();
        let frame = RgbImage::new(16, 16);

        let first = scheduler.run(&mut store, Some(&frame), t(0));
        let second = scheduler.run(&mut store, Some(&frame), t(1));
        assert_eq!((first.failed, second.failed), (1, 1));

        let identity = store.get(1).unwrap();
        assert!(identity.plugin_last_run().get("broken").is_none());
        assert_eq!(
            identity.plugin_results()["broken"].outcome,
            PluginOutcome::Failed("no model".into())
        );
    }

    #[test]
    fn test_missing_crop_or_frame_skips_silently() {
        let mut scheduler = scheduler();
        scheduler.registry_mut().register(Arc::new(FnPlugin::new(
            "body",
            InputKind::Body,
            Duration::ZERO,
            |_, _| Ok(Value::Null),
        )));
        let mut store = store_with_visible();

        let summary = scheduler.run(&mut store, Some(&RgbImage::new(16, 16)), t(0));
        assert_eq!(summary, AnalysisSummary::default());
        let summary = scheduler.run(&mut store, None, t(1));
        assert_eq!(summary, AnalysisSummary::default());
        assert!(store.get(1).unwrap().plugin_results().is_empty());
    }

    #[test]
    fn test_background_result_lands_after_flush() {
        let mut scheduler = scheduler();
        scheduler.registry_mut().register(Arc::new(
            FnPlugin::new("bg", InputKind::Generic, Duration::from_secs(1), |crop, _| {
                Ok(json!(crop.image.width()))
            })
            .background(),
        ));
        let mut store = store_with_visible();
        let frame = RgbImage::new(16, 16);

        let summary = scheduler.run(&mut store, Some(&frame), t(0));
        assert_eq!(summary.dispatched, 1);
        assert!(scheduler.is_in_flight(1, "bg"));

        // Either still in flight or already run within the interval.
        let summary = scheduler.run(&mut store, Some(&frame), t(0));
        assert_eq!(summary.dispatched, 0);

        scheduler.flush(&mut store, Duration::from_secs(5));
        assert_eq!(scheduler.in_flight(), 0);
        let identity = store.get(1).unwrap();
        assert_eq!(identity.plugin_results()["bg"].value(), Some(&json!(16)));
        assert_eq!(identity.plugin_last_run().get("bg"), Some(&t(0)));
    }

    #[test]
    fn test_hung_background_plugin_leaves_room_for_others() {
        let config = SchedulerConfig {
            worker_threads: 2,
            plugin_deadline: Duration::from_millis(50),
        };
        let mut scheduler = AnalysisScheduler::new(&config);
        let hung_calls = Arc::new(AtomicUsize::new(0));
        let healthy_calls = Arc::new(AtomicUsize::new(0));
        let hung_counter = Arc::clone(&hung_calls);
        let healthy_counter = Arc::clone(&healthy_calls);
        scheduler.registry_mut().register(Arc::new(
            FnPlugin::new("hang", InputKind::Face, Duration::from_secs(60), move |_, _| {
                hung_counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(400));
                Ok(Value::Null)
            })
            .background(),
        ));
        scheduler.registry_mut().register(Arc::new(
            FnPlugin::new("healthy", InputKind::Face, Duration::ZERO, move |_, _| {
                Ok(json!(healthy_counter.fetch_add(1, Ordering::SeqCst)))
            })
            .background(),
        ));
        let mut store = store_with_visible();
        let frame = RgbImage::new(16, 16);

        for second in 0..15 {
            scheduler.run(&mut store, Some(&frame), t(second));
            std::thread::sleep(Duration::from_millis(20));
        }
        scheduler.flush(&mut store, Duration::from_secs(2));

        assert_eq!(hung_calls.load(Ordering::SeqCst), 1);
        assert!(healthy_calls.load(Ordering::SeqCst) >= 2);
        let identity = store.get(1).unwrap();
        assert!(!identity.plugin_results()["hang"].is_success());
        assert_eq!(identity.plugin_last_run().get("hang"), Some(&t(0)));
        assert!(identity.plugin_results()["healthy"].is_success());
    }
}
