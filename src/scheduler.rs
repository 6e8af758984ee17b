//! Segment Scheduler, grounded on
//! `original_source/dash_emulator_quic/scheduler/scheduler.py::BETASchedulerImpl`.
//! Drives the per-segment download loop: consults the ABR selector, hands
//! URLs to the download manager, waits for completion, and re-enters a
//! dropped index at the lowest quality.

use crate::abr::{AbrSelector, Selection};
use crate::bandwidth::BandwidthMeter;
use crate::buffer::BufferManager;
use crate::download::DownloadManager;
use crate::models::Mpd;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Capability the scheduler fans `SegmentDownloadStart`/`SegmentDownloadComplete`
/// out to, replacing the original's `listeners: List[SchedulerEventListener]`
/// with a named capability trait composed in once at construction time.
pub trait SchedulerObserver: Send + Sync {
    fn on_segment_download_start(&self, index: u64, selections: &Selection) {
        let _ = (index, selections);
    }
    fn on_segment_download_complete(&self, index: u64) {
        let _ = index;
    }
    /// Fired only when slope smoothing (below) is enabled and has enough
    /// history to produce a slope. The playback analyzer is the only
    /// observer that records this.
    fn on_slope_diagnostics(&self, index: u64, before: &Selection, after: &Selection, slope: f64) {
        let _ = (index, before, after, slope);
    }
}

/// Configuration for the experimental slope-based quality-smoothing feature
/// (SUPPLEMENTED FEATURE, see SPEC_FULL.md §5), ported from the scheduler's
/// hard-coded `logic`/`slope_estimator` fields. Disabled unless configured.
#[derive(Debug, Clone)]
pub struct SlopeSmoothingConfig {
    pub num_previous_samples: usize,
    pub slope_threshold: f64,
    pub reduce_quality_levels: i64,
}

impl Default for SlopeSmoothingConfig {
    fn default() -> Self {
        Self {
            num_previous_samples: 3,
            slope_threshold: 0.33,
            reduce_quality_levels: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_buffer_duration: f64,
    pub update_interval: Duration,
    pub slope_smoothing: Option<SlopeSmoothingConfig>,
}

/// Ordinary-least-squares slope over `(0, 1, 2, ...)` vs. `samples`, the Rust
/// equivalent of `scipy.stats.linregress`'s slope term — no statistics crate
/// is in the teacher's or pack's stack, and the computation is a handful of
/// arithmetic lines.
fn ols_slope(samples: &[f64]) -> f64 {
    let n = samples.len() as f64;
    if n < 2.0 {
        return 0.0;
    }
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = samples.iter().sum::<f64>() / n;
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (i, &y) in samples.iter().enumerate() {
        let dx = i as f64 - mean_x;
        numerator += dx * (y - mean_y);
        denominator += dx * dx;
    }
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

struct SchedulerState {
    index: u64,
    dropped_index: Option<u64>,
    representation_initialized: HashSet<String>,
    current_selections: Option<Selection>,
    ended: bool,
    quality_history: VecDeque<i64>,
}

pub struct Scheduler {
    download_manager: Arc<dyn DownloadManager>,
    bandwidth_meter: Arc<BandwidthMeter>,
    buffer_manager: Arc<BufferManager>,
    abr_selector: Arc<AbrSelector>,
    observers: Vec<Arc<dyn SchedulerObserver>>,
    config: SchedulerConfig,
    mpd: Mutex<Mpd>,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub fn new(
        download_manager: Arc<dyn DownloadManager>,
        bandwidth_meter: Arc<BandwidthMeter>,
        buffer_manager: Arc<BufferManager>,
        abr_selector: Arc<AbrSelector>,
        observers: Vec<Arc<dyn SchedulerObserver>>,
        config: SchedulerConfig,
        initial_mpd: Mpd,
    ) -> Arc<Self> {
        Arc::new(Self {
            download_manager,
            bandwidth_meter,
            buffer_manager,
            abr_selector,
            observers,
            config,
            mpd: Mutex::new(initial_mpd),
            state: Mutex::new(SchedulerState {
                index: 0,
                dropped_index: None,
                representation_initialized: HashSet::new(),
                current_selections: None,
                ended: false,
                quality_history: VecDeque::new(),
            }),
        })
    }

    /// Replaces the manifest snapshot the scheduler selects against, called
    /// whenever the MPD provider refreshes a dynamic manifest.
    pub fn update_mpd(&self, mpd: Mpd) {
        *self.mpd.lock().unwrap() = mpd;
    }

    pub fn is_end(&self) -> bool {
        self.state.lock().unwrap().ended
    }

    /// `cancel_task(index)`: stops all representations of the current
    /// selection's segment at `index`, if `index` matches what's in flight
    /// and isn't the very first segment.
    pub async fn cancel_task(&self, index: u64) {
        let (current_index, selections) = {
            let state = self.state.lock().unwrap();
            (state.index, state.current_selections.clone())
        };
        if current_index != index || index == 0 {
            return;
        }
        let Some(selections) = selections else { return };
        let mpd = self.mpd.lock().unwrap().clone();
        for (as_id, rep_id) in &selections {
            let Some(adaptation_set) = mpd.adaptation_sets.get(as_id) else { continue };
            let Some(representation) = adaptation_set.representation(rep_id) else { continue };
            let Some(segment) = representation.segments.get(index as usize) else { continue };
            debug!("BETA: Stop current downloading URL: {}", segment.url);
            self.download_manager.stop(&segment.url).await;
        }
    }

    /// Primes the next loop iteration to re-select at the lowest quality.
    pub fn drop_index(&self, index: u64) {
        self.state.lock().unwrap().dropped_index = Some(index);
    }

    /// The scheduler's main loop, run as a single long-lived task.
    pub async fn run(self: Arc<Self>) {
        loop {
            if self.buffer_manager.buffer_level() > self.config.max_buffer_duration {
                tokio::time::sleep(self.config.update_interval).await;
                continue;
            }

            let (index, choose_lowest) = {
                let state = self.state.lock().unwrap();
                (state.index, state.dropped_index == Some(state.index))
            };

            let mpd = self.mpd.lock().unwrap().clone();
            let estimated_bps = self.bandwidth_meter.estimate();
            let mut selections = self.abr_selector.select(&mpd, estimated_bps, choose_lowest);
            let before_smoothing = selections.clone();
            if let Some(slope) = self.apply_slope_smoothing(&mut selections) {
                for observer in &self.observers {
                    observer.on_slope_diagnostics(index, &before_smoothing, &selections, slope);
                }
            }

            self.state.lock().unwrap().current_selections = Some(selections.clone());
            for observer in &self.observers {
                observer.on_segment_download_start(index, &selections);
            }

            let mut urls = Vec::new();
            let mut duration = 0.0;
            for (&as_id, rep_id) in &selections {
                let Some(adaptation_set) = mpd.adaptation_sets.get(&as_id) else { continue };
                let Some(representation) = adaptation_set.representation(rep_id) else { continue };
                let key = format!("{as_id}:{rep_id}");
                if !self.state.lock().unwrap().representation_initialized.contains(&key) {
                    self.download_manager.download(&representation.initialization_url).await;
                    match self.download_manager.wait_complete(&representation.initialization_url).await {
                        Ok(_) => {
                            self.state.lock().unwrap().representation_initialized.insert(key);
                        }
                        Err(e) => {
                            warn!("Initialization segment fetch failed for {as_id}:{rep_id}: {e}");
                        }
                    }
                }

                let Some(segment) = representation.segments.get(index as usize) else {
                    info!("Segment index {index} is past the end of representation {rep_id}");
                    self.state.lock().unwrap().ended = true;
                    return;
                };
                self.download_manager.download(&segment.url).await;
                urls.push(segment.url.clone());
                duration = segment.duration;
            }

            let mut any_dropped = false;
            for url in &urls {
                match self.download_manager.wait_complete(url).await {
                    Ok(outcome) => {
                        if outcome.into_option().is_none() {
                            any_dropped = true;
                        }
                    }
                    Err(e) => {
                        warn!("Segment fetch for {url} failed: {e}");
                        any_dropped = true;
                    }
                }
            }

            if any_dropped {
                self.state.lock().unwrap().dropped_index = Some(index);
                continue;
            }

            for observer in &self.observers {
                observer.on_segment_download_complete(index);
            }
            self.buffer_manager.enqueue_buffer(duration);
            self.state.lock().unwrap().index += 1;
        }
    }

    /// Experimental quality smoothing (SUPPLEMENTED FEATURE): adjusts the
    /// primary adaptation set's selection down by `reduce_quality_levels`
    /// quality ranks when the recent trend is flat or declining.
    fn apply_slope_smoothing(&self, selections: &mut Selection) -> Option<f64> {
        let config = self.config.slope_smoothing.as_ref()?;
        let &primary_as_id = selections.keys().min()?;
        let rep_id = selections.get(&primary_as_id).cloned()?;

        let ranked: Vec<String> = {
            let mpd = self.mpd.lock().unwrap();
            let adaptation_set = mpd.adaptation_sets.get(&primary_as_id)?;
            let mut ranked: Vec<String> = adaptation_set.representations.keys().cloned().collect();
            ranked.sort_by_key(|id| adaptation_set.representations[id].bandwidth);
            ranked
        };
        let current_rank = ranked.iter().position(|id| *id == rep_id)?;

        let mut state = self.state.lock().unwrap();
        state.quality_history.push_back(current_rank as i64);
        while state.quality_history.len() > config.num_previous_samples {
            state.quality_history.pop_front();
        }
        if state.quality_history.len() <= config.num_previous_samples {
            return None;
        }
        let samples: Vec<f64> = state.quality_history.iter().map(|&q| q as f64).collect();
        let slope = ols_slope(&samples);
        if slope > config.slope_threshold {
            return Some(slope);
        }

        let max_rank = ranked.len() as i64 - 1;
        let adjusted_rank = (current_rank as i64 - config.reduce_quality_levels).clamp(0, max_rank);
        if let Some(adjusted_id) = ranked.get(adjusted_rank as usize) {
            selections.insert(primary_as_id, adjusted_id.clone());
        }
        Some(slope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ols_slope_of_flat_series_is_zero() {
        assert_eq!(ols_slope(&[2.0, 2.0, 2.0, 2.0]), 0.0);
    }

    #[test]
    fn ols_slope_detects_rising_trend() {
        let slope = ols_slope(&[0.0, 1.0, 2.0, 3.0]);
        assert!((slope - 1.0).abs() < 1e-9);
    }

    #[test]
    fn ols_slope_detects_falling_trend() {
        let slope = ols_slope(&[3.0, 2.0, 1.0, 0.0]);
        assert!((slope + 1.0).abs() < 1e-9);
    }

    #[test]
    fn ols_slope_needs_at_least_two_samples() {
        assert_eq!(ols_slope(&[5.0]), 0.0);
        assert_eq!(ols_slope(&[]), 0.0);
    }
}
