//! The BETA download governor — the core of this crate.
//!
//! Grounded directly on `original_source/dash_emulator_quic/beta/beta.py`:
//! a single-task event loop that watches live byte progress against buffer
//! occupancy and bandwidth, and decides whether the current segment download
//! should run to completion, be stopped early (keeping the received prefix),
//! or be dropped and re-requested at the lowest quality.
//!
//! The original listens via four mixed-in listener interfaces
//! (`DownloadEventListener`, `PlayerEventListener`, `SchedulerEventListener`,
//! `BandwidthUpdateListener`); here a single `BetaGovernorHandle` implements
//! the two fan-out capability traits (`ProgressSink`, `BandwidthSink`) plus
//! plain methods for the player/scheduler notifications, all funnelling into
//! one event queue owned by exactly one task — preserving the original's
//! single-threaded cooperative-scheduling guarantee without literally
//! running single-threaded.

pub mod events;
pub mod vq_threshold;

use crate::abr::Selection;
use crate::bandwidth::BandwidthSink;
use crate::clock::SharedClock;
use crate::download::{DownloadManager, ProgressSink};
use crate::models::{PlayerState, SegmentRequest, StateSink};
use crate::scheduler::SchedulerObserver;
use beta_events::BetaEvent;
use events as beta_events;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use vq_threshold::VqThresholdManager;

/// Ratio below which a segment's received prefix is considered negligible
/// (`MIN_REF_RATIO` in the original).
const MIN_REF_RATIO: f64 = 0.1;

/// The decision ladder's max-timeout branch defaults to `stop`, matching the
/// most recent behavior observed in the source tree. Setting this flag
/// restores the earlier `drop_and_replace` variant some copies used at that
/// branch.
#[derive(Debug, Clone, Copy)]
pub struct GovernorPolicy {
    pub drop_and_replace_on_max_timeout: bool,
}

impl Default for GovernorPolicy {
    fn default() -> Self {
        Self {
            drop_and_replace_on_max_timeout: false,
        }
    }
}

/// Handle producers (the download manager, the bandwidth meter, the
/// scheduler, the player) push events through; the governor's own state
/// lives exclusively inside the task spawned by [`spawn`].
pub struct BetaGovernorHandle {
    event_tx: mpsc::UnboundedSender<BetaEvent>,
}

impl BetaGovernorHandle {
    fn emit(&self, event: BetaEvent) {
        // The receiving task only ever stops by being aborted at shutdown;
        // a closed channel here means that has already happened.
        let _ = self.event_tx.send(event);
    }

}

impl SchedulerObserver for BetaGovernorHandle {
    fn on_segment_download_start(&self, index: u64, selections: &Selection) {
        self.emit(BetaEvent::SegmentDownloadStart { index, selections: selections.clone() });
    }

    fn on_segment_download_complete(&self, index: u64) {
        self.emit(BetaEvent::SegmentDownloadComplete { index });
    }
}

impl StateSink for BetaGovernorHandle {
    fn on_buffer_level_change(&self, buffer_level: f64) {
        self.emit(BetaEvent::BufferLevelChange { buffer_level });
    }

    fn on_state_change(&self, state: PlayerState) {
        self.emit(BetaEvent::StateChange { state });
    }
}

impl ProgressSink for BetaGovernorHandle {
    fn on_transfer_start(&self, url: &str) {
        self.emit(BetaEvent::TransferStart { url: url.to_string() });
    }

    fn on_bytes_transferred(&self, length: u64, url: &str, position: u64, size: u64) {
        self.emit(BetaEvent::BytesTransferred {
            length,
            url: url.to_string(),
            position,
            size,
        });
    }

    fn on_transfer_end(&self, size: u64, url: &str) {
        self.emit(BetaEvent::TransferEnd { size, url: url.to_string() });
    }

    fn on_transfer_canceled(&self, url: &str, position: u64, size: u64) {
        self.emit(BetaEvent::TransferCanceled {
            url: url.to_string(),
            position,
            size,
        });
    }
}

impl BandwidthSink for BetaGovernorHandle {
    fn on_bandwidth_update(&self, bw_bits_per_second: u64) {
        self.emit(BetaEvent::BandwidthUpdate { bw_bps: bw_bits_per_second });
    }
}

struct GovernorState {
    bw: u64,
    buffer_level: f64,
    state: PlayerState,
    current_segment: Option<SegmentRequest>,
    pending_segment: Option<SegmentRequest>,
    timeout: Option<std::time::Instant>,
    max_timeout: Option<std::time::Instant>,
    dropped_urls: HashSet<String>,
    dropped_indices: HashSet<u64>,
    clock: SharedClock,
}

impl GovernorState {
    fn new(clock: SharedClock) -> Self {
        Self {
            bw: 0,
            buffer_level: 0.0,
            state: PlayerState::Ready,
            current_segment: None,
            pending_segment: None,
            timeout: None,
            max_timeout: None,
            dropped_urls: HashSet::new(),
            dropped_indices: HashSet::new(),
            clock,
        }
    }

    async fn process(
        &mut self,
        event: BetaEvent,
        download_manager: &Arc<dyn DownloadManager>,
        vq_threshold_manager: &Arc<dyn VqThresholdManager>,
        panic_buffer_level: f64,
        safe_buffer_level: f64,
        policy: &GovernorPolicy,
    ) {
        match event {
            BetaEvent::BandwidthUpdate { bw_bps } => self.bw = bw_bps,
            BetaEvent::BufferLevelChange { buffer_level } => self.buffer_level = buffer_level,
            BetaEvent::StateChange { state } => self.state = state,
            BetaEvent::SegmentDownloadStart { index, .. } => {
                self.current_segment = Some(SegmentRequest::new(index));
                // First segment: bandwidth hasn't been estimated yet, the
                // ladder below is not applied to it (matches the source's
                // early return when `self._bw == 0`).
            }
            BetaEvent::TransferStart { url } => {
                if let Some(current) = &mut self.current_segment {
                    debug!("Start downloading {url}");
                    current.url = Some(url);
                }
            }
            BetaEvent::BytesTransferred { length, url, position, size } => {
                self.bytes_transferred(
                    length,
                    url,
                    position,
                    size,
                    download_manager,
                    vq_threshold_manager,
                    panic_buffer_level,
                    safe_buffer_level,
                    policy,
                )
                .await;
            }
            // TransferEnd, TransferCanceled and SegmentDownloadComplete carry
            // no governor-side reaction in the source ladder; retained here
            // only to keep the event enum exhaustive for producers.
            BetaEvent::TransferEnd { .. } | BetaEvent::TransferCanceled { .. } | BetaEvent::SegmentDownloadComplete { .. } => {}
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn bytes_transferred(
        &mut self,
        length: u64,
        url: String,
        position: u64,
        size: u64,
        download_manager: &Arc<dyn DownloadManager>,
        vq_threshold_manager: &Arc<dyn VqThresholdManager>,
        panic_buffer_level: f64,
        safe_buffer_level: f64,
        policy: &GovernorPolicy,
    ) {
        debug!("Bytes received ({position}/{size}) {url}");

        // 1. Reconcile pending stream.
        if let Some(pending) = &self.pending_segment {
            if pending.url.as_deref() != Some(url.as_str()) {
                if let Some(pending_url) = &pending.url {
                    info!("Cancel pending segment {pending_url}");
                    download_manager.cancel_read(pending_url);
                }
                self.pending_segment = None;
            } else {
                return;
            }
        }

        // 2. Fast path: buffer healthy.
        if self.buffer_level > safe_buffer_level {
            return;
        }

        // 3. Filter dropped identities.
        if self.dropped_urls.contains(&url) {
            return;
        }
        let current_index = match &self.current_segment {
            Some(current) => current.index,
            None => return,
        };
        if self.dropped_indices.contains(&current_index) && self.current_segment.as_ref().and_then(|c| c.url.as_deref()) != Some(url.as_str()) {
            return;
        }

        // 4. First-byte initialization.
        let first_bytes_received = self.current_segment.as_ref().map(|c| c.first_bytes_received).unwrap_or(true);
        if !first_bytes_received {
            if let Some(current) = &mut self.current_segment {
                current.first_bytes_received = true;
            }
            let timeout_secs = if self.bw == 0 {
                10.0
            } else {
                size.saturating_sub(length) as f64 * 8.0 / self.bw as f64
            };
            let max_timeout_secs = timeout_secs * 2.0;
            info!("BETA: calculate timeout: {timeout_secs}, max timeout {max_timeout_secs}");
            let now = self.clock.now();
            self.timeout = Some(now + Duration::from_secs_f64(timeout_secs));
            self.max_timeout = Some(now + Duration::from_secs_f64(max_timeout_secs));
            return;
        }

        // 5. Computed ratio.
        let ratio = if size == 0 { 0.0 } else { position as f64 / size as f64 };
        let now = self.clock.now();
        let current_url = self.current_segment.as_ref().and_then(|c| c.url.clone());

        // 6. Stall recovery rule.
        if current_index != 0
            && current_url.as_deref() == Some(url.as_str())
            && self.state == PlayerState::Buffering
            && ratio > MIN_REF_RATIO
        {
            self.stop_download(download_manager).await;
            return;
        }

        // 7. Panic rule.
        if ratio > MIN_REF_RATIO && self.buffer_level < panic_buffer_level {
            self.stop_download(download_manager).await;
            return;
        }

        // 8. Pre-timeout.
        if let Some(timeout) = self.timeout {
            if now < timeout {
                return;
            }
        }

        // 9. VQ-threshold rule.
        if ratio > vq_threshold_manager.get_threshold(current_index) {
            self.stop_download(download_manager).await;
            return;
        }

        // 10. Panic after timeout.
        if self.buffer_level < panic_buffer_level {
            self.stop_download(download_manager).await;
            return;
        }

        // 11. Max-timeout rule.
        if let Some(max_timeout) = self.max_timeout {
            if now > max_timeout && ratio < MIN_REF_RATIO {
                if policy.drop_and_replace_on_max_timeout {
                    self.drop_and_replace(download_manager).await;
                } else {
                    self.stop_download(download_manager).await;
                }
                return;
            }
        }

        // 12. Default.
        self.stop_download(download_manager).await;
    }

    /// Idempotent per URL: only calls `download_manager.stop` when no
    /// pending segment already holds this URL.
    async fn stop_download(&mut self, download_manager: &Arc<dyn DownloadManager>) {
        let current = match self.current_segment.clone() {
            Some(c) => c,
            None => return,
        };
        let url = match &current.url {
            Some(u) => u.clone(),
            None => return,
        };
        debug!("BETA: Stop Downloading: {url}");
        let already_pending = self
            .pending_segment
            .as_ref()
            .map(|p| p.url.as_deref() == Some(url.as_str()))
            .unwrap_or(false);
        if !already_pending {
            download_manager.stop(&url).await;
        }
        self.pending_segment = Some(current);
    }

    async fn drop_and_replace(&mut self, download_manager: &Arc<dyn DownloadManager>) {
        let current = match self.current_segment.clone() {
            Some(c) => c,
            None => return,
        };
        let url = match &current.url {
            Some(u) => u.clone(),
            None => return,
        };
        info!("BETA: Drop URL: {url} and replace with the lowest bitrate");
        self.dropped_urls.insert(url.clone());
        self.dropped_indices.insert(current.index);
        download_manager.drop_url(&url).await;
        download_manager.cancel_read(&url);
    }
}

/// Spawns the governor's single event-consuming task and returns a cheaply
/// cloneable handle producers push events through.
pub fn spawn(
    download_manager: Arc<dyn DownloadManager>,
    vq_threshold_manager: Arc<dyn VqThresholdManager>,
    panic_buffer_level: f64,
    safe_buffer_level: f64,
    policy: GovernorPolicy,
    clock: SharedClock,
) -> (Arc<BetaGovernorHandle>, JoinHandle<()>) {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<BetaEvent>();
    let handle = Arc::new(BetaGovernorHandle { event_tx });

    let task = tokio::spawn(async move {
        let mut state = GovernorState::new(clock);
        while let Some(event) = event_rx.recv().await {
            state
                .process(
                    event,
                    &download_manager,
                    &vq_threshold_manager,
                    panic_buffer_level,
                    safe_buffer_level,
                    &policy,
                )
                .await;
        }
    });

    (handle, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::error::TransportError;
    use crate::models::DownloadOutcome;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    struct RecordingDownloadManager {
        stop_calls: StdMutex<Vec<String>>,
        drop_calls: StdMutex<Vec<String>>,
        cancel_read_calls: StdMutex<Vec<String>>,
        notify: Notify,
    }

    impl RecordingDownloadManager {
        fn new() -> Self {
            Self {
                stop_calls: StdMutex::new(Vec::new()),
                drop_calls: StdMutex::new(Vec::new()),
                cancel_read_calls: StdMutex::new(Vec::new()),
                notify: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl DownloadManager for RecordingDownloadManager {
        async fn download(&self, _url: &str) {}

        async fn wait_complete(&self, _url: &str) -> Result<DownloadOutcome, TransportError> {
            Ok(DownloadOutcome::Dropped)
        }

        async fn stop(&self, url: &str) {
            self.stop_calls.lock().unwrap().push(url.to_string());
            self.notify.notify_one();
        }

        async fn drop_url(&self, url: &str) {
            self.drop_calls.lock().unwrap().push(url.to_string());
            self.notify.notify_one();
        }

        fn cancel_read(&self, url: &str) {
            self.cancel_read_calls.lock().unwrap().push(url.to_string());
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn panic_rule_stops_exactly_once() {
        // panic_buffer_level=3, safe=7.5, bw=1_000_000, size=2_000_000
        // (8s nominal).
        let recorder = Arc::new(RecordingDownloadManager::new());
        let download_manager: Arc<dyn DownloadManager> = recorder.clone();
        let clock: SharedClock = Arc::new(MockClock::new());
        let (handle, _task) = spawn(
            download_manager,
            Arc::new(vq_threshold::FixedVqThresholdManager::default()),
            3.0,
            7.5,
            GovernorPolicy::default(),
            clock,
        );

        handle.on_buffer_level_change(8.0);
        handle.on_segment_download_start(0, &Selection::new());
        let bandwidth_sink: &dyn BandwidthSink = &*handle;
        bandwidth_sink.on_bandwidth_update(1_000_000);
        let progress_sink: &dyn ProgressSink = &*handle;
        progress_sink.on_transfer_start("http://example.test/seg-0.m4s");
        progress_sink.on_bytes_transferred(100_000, "http://example.test/seg-0.m4s", 100_000, 2_000_000);

        handle.on_buffer_level_change(2.0);
        progress_sink.on_bytes_transferred(300_000, "http://example.test/seg-0.m4s", 400_000, 2_000_000);

        // Drain the governor's single task.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(recorder.stop_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pending_segment_cleanup_does_not_issue_a_second_stop() {
        // Stop segment A at ratio 0.5, then a BytesTransferred for segment B
        // arrives; the governor must call cancel_read on A and clear
        // pending_segment without a second stop.
        let recorder = Arc::new(RecordingDownloadManager::new());
        let download_manager: Arc<dyn DownloadManager> = recorder.clone();
        let clock: SharedClock = Arc::new(MockClock::new());
        let (handle, _task) = spawn(
            download_manager,
            Arc::new(vq_threshold::FixedVqThresholdManager::default()),
            3.0,
            7.5,
            GovernorPolicy::default(),
            clock,
        );

        handle.on_buffer_level_change(2.0);
        handle.on_segment_download_start(0, &Selection::new());
        let bandwidth_sink: &dyn BandwidthSink = &*handle;
        bandwidth_sink.on_bandwidth_update(1_000_000);
        let progress_sink: &dyn ProgressSink = &*handle;
        progress_sink.on_transfer_start("http://example.test/seg-a.m4s");
        progress_sink.on_bytes_transferred(100_000, "http://example.test/seg-a.m4s", 100_000, 2_000_000);
        progress_sink.on_bytes_transferred(900_000, "http://example.test/seg-a.m4s", 1_000_000, 2_000_000);

        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(recorder.stop_calls.lock().unwrap().len(), 1);

        handle.on_segment_download_start(1, &Selection::new());
        progress_sink.on_transfer_start("http://example.test/seg-b.m4s");
        progress_sink.on_bytes_transferred(50_000, "http://example.test/seg-b.m4s", 50_000, 2_000_000);

        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(recorder.stop_calls.lock().unwrap().len(), 1);
        assert_eq!(recorder.cancel_read_calls.lock().unwrap().as_slice(), ["http://example.test/seg-a.m4s"]);
    }
}
