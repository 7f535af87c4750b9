use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use image::RgbImage;
use ndarray::{Array1, array};
use persona_track::identity::Sample;
use persona_track::{
    Detection, FnPlugin, Frame, IdentityRecord, IdentityState, IdentityStorage, IdentityTracker,
    InputKind, MemoryStorage, PluginError, PluginOutcome, Rect, StorageError, TrackerConfig,
    TrackingError,
};
use serde_json::{Value, json};

fn t(frame: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap() + chrono::Duration::milliseconds(40 * frame)
}

fn config() -> TrackerConfig {
    TrackerConfig {
        embedding_dim: 4,
        ..TrackerConfig::default()
    }
}

fn person(index: usize) -> Array1<f32> {
    let mut embedding = Array1::zeros(4);
    embedding[index % 4] = 3.0 * (1 + index / 4) as f32;
    embedding
}

fn frame(people: &[Array1<f32>]) -> Frame {
    let detections = people
        .iter()
        .enumerate()
        .map(|(i, embedding)| {
            let face = Rect::new(20.0 + 60.0 * i as f32, 20.0, 30.0, 30.0);
            Detection::face(face, embedding.clone())
        })
        .collect();
    Frame::new(detections).with_image(RgbImage::new(480, 120))
}

fn record(id: u64, embedding: Array1<f32>, count: usize, start: DateTime<Utc>) -> IdentityRecord {
    let samples: Vec<Sample> = (0..count)
        .map(|i| Sample::new(embedding.clone(), start + chrono::Duration::seconds(i as i64)))
        .collect();
    IdentityRecord {
        id,
        display_name: None,
        sample_count: count as u64,
        samples,
        created_at: start,
        last_seen_at: start,
        plugin_results: BTreeMap::new(),
    }
}

#[test]
fn test_promotion_then_retirement_timeline() {
    let storage = MemoryStorage::new();
    let mut tracker = IdentityTracker::with_storage(config(), storage.clone()).unwrap();
    let a = person(0);

    for n in 1..=4 {
        let report = tracker.process_frame(&frame(&[a.clone()]), t(n)).unwrap();
        assert!(report.visible.is_empty(), "frame {n} must not confirm yet");
    }
    let report = tracker.process_frame(&frame(&[a.clone()]), t(5)).unwrap();
    assert_eq!(report.events.promoted, vec![1]);
    assert_eq!(report.visible.len(), 1);

    let mut previous_missed = 0;
    for n in 6..=55 {
        tracker.process_frame(&frame(&[]), t(n)).unwrap();
        let identity = tracker.identity(1).unwrap();
        assert_eq!(identity.missed_frames(), previous_missed + 1);
        assert_eq!(identity.state(), IdentityState::Lost);
        previous_missed = identity.missed_frames();
    }
    assert!(storage.is_empty());

    let report = tracker.process_frame(&frame(&[]), t(56)).unwrap();
    assert_eq!(report.events.retired, vec![1]);
    assert_eq!(storage.get(1).map(|r| r.sample_count), Some(5));
    // Written to storage, then dropped from memory.
    assert!(tracker.identity(1).is_none());

    // The same face afterwards is a stranger again.
    let report = tracker.process_frame(&frame(&[a.clone()]), t(57)).unwrap();
    assert!(report.visible.is_empty());
    assert_eq!(tracker.candidate_count(), 1);
    assert!(tracker.identity(1).is_none());
}

#[test]
fn test_duplicate_merge_combines_sample_histories() {
    let storage = MemoryStorage::with_records([
        record(2, array![1.0, 0.0, 0.0, 0.0], 40, t(0)),
        record(3, array![1.15, 0.0, 0.0, 0.0], 30, t(10_000)),
    ]);
    let config = TrackerConfig {
        duplicate_threshold: 0.2,
        ..config()
    };
    let mut tracker = IdentityTracker::with_storage(config.clone(), storage.clone()).unwrap();

    let proposals = tracker.find_duplicates();
    assert_eq!(proposals.len(), 1);
    approx::assert_abs_diff_eq!(proposals[0].distance, 0.15, epsilon = 1e-5);

    let merges = tracker.resolve_duplicates().unwrap();
    assert_eq!(merges.len(), 1);
    assert_eq!((merges[0].survivor, merges[0].absorbed), (2, 3));

    let survivor = tracker.identity(2).unwrap();
    assert_eq!(survivor.sample_count(), 70);
    assert_eq!(survivor.samples().len(), 50);
    // The oldest samples of identity 2 were evicted; all of 3's remain.
    let newer = survivor
        .samples()
        .iter()
        .filter(|sample| sample.embedding[0] > 1.1)
        .count();
    assert_eq!(newer, 30);
    assert!(tracker.identity(3).is_none());

    assert!(tracker.resolve_duplicates().unwrap().is_empty());
    assert_eq!(
        tracker.merge_identities(2, 3).unwrap_err(),
        TrackingError::UnknownIdentity(3)
    );

    // The merge holds across a restart.
    assert!(storage.get(3).is_none());
    assert_eq!(storage.get(2).map(|r| r.sample_count), Some(70));
    drop(tracker);
    let restarted = IdentityTracker::with_storage(config, storage).unwrap();
    assert!(restarted.identity(3).is_none());
    assert_eq!(restarted.identity(2).map(|identity| identity.sample_count()), Some(70));
    assert!(restarted.find_duplicates().is_empty());
}

#[test]
fn test_ids_stay_unique_across_crowded_sequence() {
    let mut tracker = IdentityTracker::new(TrackerConfig {
        max_missed_frames: 10,
        ..config()
    })
    .unwrap();
    let people: Vec<Array1<f32>> = (0..8).map(person).collect();
    let mut seen = HashSet::new();

    for n in 0..200i64 {
        // Each person is present for a stretch, then gone for a while.
        let present: Vec<Array1<f32>> = people
            .iter()
            .enumerate()
            .filter(|(i, _)| ((n as usize + 7 * i) / 15) % 3 != 0)
            .map(|(_, p)| p.clone())
            .collect();
        let report = tracker.process_frame(&frame(&present), t(n)).unwrap();

        let visible: Vec<u64> = report.visible.iter().map(|v| v.id).collect();
        let unique: HashSet<u64> = visible.iter().copied().collect();
        assert_eq!(unique.len(), visible.len());
        assert!(visible.len() <= present.len());
        for id in report.events.promoted {
            assert!(seen.insert(id), "id {id} allocated twice");
        }
    }
    assert!(seen.len() >= people.len());
}

#[test]
fn test_failing_plugins_never_disturb_tracking() {
    let mut tracker = IdentityTracker::new(config()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    tracker.register_plugin(FnPlugin::new(
        "flaky",
        InputKind::Face,
        Duration::ZERO,
        move |_, _| -> Result<Value, PluginError> {
            let call = counter.fetch_add(1, Ordering::SeqCst);
            if call % 100 == 0 {
                panic!("flaky plugin crashed on call {call}");
            }
            Err(PluginError::failed("no signal"))
        },
    ));
    tracker.register_plugin(FnPlugin::new(
        "steady",
        InputKind::Generic,
        Duration::ZERO,
        |_, who| Ok(json!(who.id)),
    ));

    let a = person(1);
    for n in 0..1000 {
        let report = tracker.process_frame(&frame(&[a.clone()]), t(n)).unwrap();
        if n >= 4 {
            assert_eq!(report.visible.len(), 1);
            assert_eq!(report.visible[0].id, 1);
            assert_eq!(report.analysis.failed, 1);
            assert_eq!(report.analysis.succeeded, 1);
        }
    }

    assert_eq!(calls.load(Ordering::SeqCst), 996);
    let identity = tracker.identity(1).unwrap();
    assert!(identity.plugin_last_run().get("flaky").is_none());
    assert!(matches!(
        identity.plugin_results()["flaky"].outcome,
        PluginOutcome::Failed(_)
    ));
    assert_eq!(identity.plugin_results()["steady"].value(), Some(&json!(1)));
    assert_eq!(identity.sample_count(), 1000);
}

#[test]
fn test_background_plugin_has_one_job_in_flight_per_identity() {
    let embedding = person(2);
    let storage = MemoryStorage::with_records([record(7, embedding.clone(), 10, t(0))]);
    let config = TrackerConfig {
        scheduler: persona_track::SchedulerConfig {
            worker_threads: 4,
            plugin_deadline: Duration::from_secs(5),
        },
        ..config()
    };
    let mut tracker = IdentityTracker::with_storage(config, storage).unwrap();

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let invocations = Arc::new(AtomicUsize::new(0));
    let running_c = Arc::clone(&running);
    let peak_c = Arc::clone(&peak);
    let invocations_c = Arc::clone(&invocations);
    tracker.register_plugin(
        FnPlugin::new("activity", InputKind::Face, Duration::ZERO, move |_, who| {
            let now = running_c.fetch_add(1, Ordering::SeqCst) + 1;
            peak_c.fetch_max(now, Ordering::SeqCst);
            invocations_c.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(30));
            running_c.fetch_sub(1, Ordering::SeqCst);
            Ok(json!({ "id": who.id, "activity": "standing" }))
        })
        .background(),
    );

    let first = tracker.process_frame(&frame(&[embedding.clone()]), t(1)).unwrap();
    assert_eq!(first.events.reidentified, vec![7]);
    assert_eq!(first.analysis.dispatched, 1);

    for n in 2..40 {
        let report = tracker.process_frame(&frame(&[embedding.clone()]), t(n)).unwrap();
        assert!(report.analysis.dispatched <= 1);
        std::thread::sleep(Duration::from_millis(2));
    }
    tracker.flush_analysis(Duration::from_secs(5));

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert!(invocations.load(Ordering::SeqCst) >= 1);
    assert_eq!(tracker.scheduler().in_flight(), 0);
    let result = &tracker.results_for_identity(7).unwrap()["activity"];
    assert_eq!(result.value(), Some(&json!({ "id": 7, "activity": "standing" })));
}

#[test]
fn test_identities_survive_restart() {
    let storage = MemoryStorage::new();
    let a = person(3);
    {
        let mut tracker = IdentityTracker::with_storage(config(), storage.clone()).unwrap();
        for n in 0..5 {
            tracker.process_frame(&frame(&[a.clone()]), t(n)).unwrap();
        }
        tracker.rename(1, Some("Ana".into())).unwrap();
        assert_eq!(tracker.persist_all().unwrap(), 1);
    }

    let mut tracker = IdentityTracker::with_storage(config(), storage).unwrap();
    let restored = tracker.identity(1).unwrap();
    assert_eq!(restored.state(), IdentityState::Lost);
    assert!(!restored.is_visible());
    assert_eq!(tracker.store().next_id(), 2);

    let report = tracker.process_frame(&frame(&[a.clone()]), t(100)).unwrap();
    assert_eq!(report.events.reidentified, vec![1]);
    assert_eq!(report.visible[0].display_name.as_deref(), Some("Ana"));
}

struct BrokenStorage;

impl IdentityStorage for BrokenStorage {
    fn persist(&mut self, _record: &IdentityRecord) -> Result<(), StorageError> {
        Err(StorageError::new("disk full"))
    }

    fn remove(&mut self, _id: u64) -> Result<(), StorageError> {
        Err(StorageError::new("disk full"))
    }

    fn load_all(&mut self) -> Result<Vec<IdentityRecord>, StorageError> {
        Ok(Vec::new())
    }
}

#[test]
fn test_storage_failure_on_retirement_is_reported_not_fatal() {
    let mut tracker = IdentityTracker::with_storage(
        TrackerConfig {
            min_frames_to_confirm: 1,
            max_missed_frames: 0,
            ..config()
        },
        BrokenStorage,
    )
    .unwrap();

    tracker.process_frame(&frame(&[person(0)]), t(0)).unwrap();
    let report = tracker.process_frame(&frame(&[]), t(1)).unwrap();
    assert_eq!(report.events.retired, vec![1]);
    assert_eq!(report.persist_failures, 1);
    assert!(tracker.process_frame(&frame(&[]), t(2)).is_ok());
}

#[test]
fn test_unwritten_retired_identity_stays_read_only() {
    let mut tracker = IdentityTracker::with_storage(
        TrackerConfig {
            min_frames_to_confirm: 1,
            max_missed_frames: 0,
            ..config()
        },
        BrokenStorage,
    )
    .unwrap();
    tracker.process_frame(&frame(&[person(0)]), t(0)).unwrap();
    tracker.process_frame(&frame(&[]), t(1)).unwrap();

    assert_eq!(tracker.identity(1).unwrap().state(), IdentityState::Retired);
    assert_eq!(
        tracker.rename(1, Some("late".into())),
        Err(TrackingError::RetiredIdentity(1))
    );
    assert!(matches!(
        tracker.delete_identity(1),
        Err(TrackingError::Storage(_))
    ));
    assert!(tracker.persist_all().is_err());
    assert_eq!(tracker.purge_retired().len(), 1);
    assert!(tracker.identity(1).is_none());
}
