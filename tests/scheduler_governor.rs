//! Integration test driving the scheduler against a fake in-memory
//! `DownloadManager`, exercising the drop-and-replace flow end-to-end
//! (spec.md §8, scenario 4): a dropped segment is re-entered at the lowest
//! quality while the scheduler's `_index` stays put until it succeeds.

use async_trait::async_trait;
use dash_emulator::abr::{AbrSelector, DefaultBandwidthSelector, Selection};
use dash_emulator::bandwidth::BandwidthMeter;
use dash_emulator::buffer::BufferManager;
use dash_emulator::clock::{MockClock, SharedClock};
use dash_emulator::download::DownloadManager;
use dash_emulator::error::TransportError;
use dash_emulator::models::{AdaptationSet, ManifestType, Mpd, Representation, Segment};
use dash_emulator::scheduler::{Scheduler, SchedulerConfig, SchedulerObserver};
use dash_emulator::models::DownloadOutcome;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn representation(id: &str, bandwidth: u64, segment_count: u64) -> Representation {
    Representation {
        id: id.to_string(),
        bandwidth,
        initialization_url: format!("http://example.test/{id}/init.mp4"),
        segments: (0..segment_count)
            .map(|i| Segment {
                index: i,
                url: format!("http://example.test/{id}/seg-{i}.m4s"),
                duration: 2.0,
            })
            .collect(),
    }
}

fn two_quality_mpd(segment_count: u64) -> Mpd {
    let mut representations = HashMap::new();
    representations.insert("lo".to_string(), representation("lo", 500_000, segment_count));
    representations.insert("hi".to_string(), representation("hi", 4_000_000, segment_count));
    let adaptation_set = AdaptationSet {
        id: 0,
        content_type: "video".to_string(),
        representations,
    };
    let mut adaptation_sets = HashMap::new();
    adaptation_sets.insert(0, adaptation_set);
    Mpd {
        manifest_type: ManifestType::Static,
        minimum_update_period: None,
        adaptation_sets,
    }
}

/// A download manager whose `wait_complete` is scripted per URL: every URL
/// completes immediately except `fail_once_url`, which reports `Dropped`
/// exactly once and then completes on any subsequent request.
struct ScriptedDownloadManager {
    fail_once_url: String,
    already_failed: AtomicUsize,
}

#[async_trait]
impl DownloadManager for ScriptedDownloadManager {
    async fn download(&self, _url: &str) {}

    async fn wait_complete(&self, url: &str) -> Result<DownloadOutcome, TransportError> {
        if url == self.fail_once_url && self.already_failed.fetch_add(1, Ordering::SeqCst) == 0 {
            return Ok(DownloadOutcome::Dropped);
        }
        Ok(DownloadOutcome::Completed {
            data: bytes::Bytes::from_static(b"data"),
            size: 4,
        })
    }

    async fn stop(&self, _url: &str) {}
    async fn drop_url(&self, _url: &str) {}
    fn cancel_read(&self, _url: &str) {}
    async fn close(&self) {}
}

struct RecordingObserver {
    starts: Mutex<Vec<(u64, Selection)>>,
    completes: Mutex<Vec<u64>>,
}

impl RecordingObserver {
    fn new() -> Self {
        Self {
            starts: Mutex::new(Vec::new()),
            completes: Mutex::new(Vec::new()),
        }
    }
}

impl SchedulerObserver for RecordingObserver {
    fn on_segment_download_start(&self, index: u64, selections: &Selection) {
        self.starts.lock().unwrap().push((index, selections.clone()));
    }

    fn on_segment_download_complete(&self, index: u64) {
        self.completes.lock().unwrap().push(index);
    }
}

#[tokio::test]
async fn drop_and_replace_re_enters_the_same_index_at_lowest_quality() {
    let mpd = two_quality_mpd(2);
    let fail_once_url = mpd
        .adaptation_sets
        .get(&0)
        .unwrap()
        .representation("hi")
        .unwrap()
        .segments[0]
        .url
        .clone();

    let download_manager: Arc<dyn DownloadManager> = Arc::new(ScriptedDownloadManager {
        fail_once_url,
        already_failed: AtomicUsize::new(0),
    });
    let clock: SharedClock = Arc::new(MockClock::new());
    // Budgeted at 95% this clears the "hi" representation's bandwidth, so
    // the first attempt at every index picks "hi" and only the scripted
    // drop forces a lowest-quality replacement.
    let bandwidth_meter = Arc::new(BandwidthMeter::new(0.25, Duration::from_millis(500), 10_000_000.0, clock));
    let buffer_manager = Arc::new(BufferManager::new());
    let abr_selector = Arc::new(AbrSelector::new(Box::new(DefaultBandwidthSelector::default())));
    let observer = Arc::new(RecordingObserver::new());

    let scheduler = Scheduler::new(
        download_manager,
        bandwidth_meter,
        buffer_manager,
        abr_selector,
        vec![observer.clone()],
        SchedulerConfig {
            max_buffer_duration: 100.0,
            update_interval: Duration::from_millis(5),
            slope_smoothing: None,
        },
        mpd,
    );

    tokio::time::timeout(Duration::from_secs(5), scheduler.run())
        .await
        .expect("scheduler reaches the end of the two-segment timeline well within the timeout");

    let starts = observer.starts.lock().unwrap().clone();
    let index_0_starts: Vec<&Selection> = starts.iter().filter(|(i, _)| *i == 0).map(|(_, s)| s).collect();

    // The first attempt at index 0 picks "hi" (ample estimated bandwidth);
    // it gets dropped, so a second SegmentDownloadStart(0) fires with the
    // lowest-bandwidth representation forced.
    assert_eq!(index_0_starts.len(), 2, "expected a replacement start after the drop");
    assert_eq!(index_0_starts[0].get(&0).unwrap(), "hi");
    assert_eq!(index_0_starts[1].get(&0).unwrap(), "lo");

    let completes = observer.completes.lock().unwrap().clone();
    assert!(completes.contains(&0));
    assert!(completes.contains(&1));
}

#[tokio::test]
async fn final_segment_beyond_timeline_ends_cleanly() {
    let mpd = two_quality_mpd(1);
    let download_manager: Arc<dyn DownloadManager> = Arc::new(ScriptedDownloadManager {
        fail_once_url: String::new(),
        already_failed: AtomicUsize::new(1),
    });
    let clock: SharedClock = Arc::new(MockClock::new());
    let bandwidth_meter = Arc::new(BandwidthMeter::new(0.25, Duration::from_millis(500), 4_000_000.0, clock));
    let buffer_manager = Arc::new(BufferManager::new());
    let abr_selector = Arc::new(AbrSelector::new(Box::new(DefaultBandwidthSelector::default())));

    let scheduler = Scheduler::new(
        download_manager,
        bandwidth_meter,
        buffer_manager,
        abr_selector,
        vec![],
        SchedulerConfig {
            max_buffer_duration: 100.0,
            update_interval: Duration::from_millis(5),
            slope_smoothing: None,
        },
        mpd,
    );

    scheduler.clone().run().await;
    assert!(scheduler.is_end());
}
