//! Playback Analyzer, grounded on
//! `original_source/dash_emulator_quic/analyzers/analyer.py::BETAPlaybackAnalyzer`.
//! Aggregates lifecycle events into a textual report (segment table, stalls
//! table, summary) and an optional JSON dump.
//!
//! The original multiply-inherits four listener mixins; here one struct
//! implements the four capability traits (`ProgressSink`, `BandwidthSink`,
//! `StateSink`, `SchedulerObserver`) directly — composition, no behavioral
//! loss.
//!
//! The original's `save` logic is duplicated across three variants with
//! divergent fields; here the JSON dump always carries the core per-segment
//! fields (index, start, end, quality, bitrate, throughput, ratio, url), and
//! a `slope_diagnostics` object is attached only for segments where the
//! experimental slope-smoothing feature actually ran (see
//! `scheduler::SchedulerObserver::on_slope_diagnostics`).

use crate::abr::Selection;
use crate::bandwidth::BandwidthSink;
use crate::clock::SharedClock;
use crate::download::ProgressSink;
use crate::models::{PlayerState, StateSink};
use crate::mpd::MpdProvider;
use crate::scheduler::SchedulerObserver;
use serde::Serialize;
use std::io::Write;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Serialize)]
pub struct SlopeDiagnostics {
    pub selection_before_logic: Selection,
    pub selection_after_logic: Selection,
    pub slope_value: f64,
}

#[derive(Debug, Clone)]
pub struct AnalyzerSegment {
    pub index: u64,
    pub start_time: f64,
    pub completion_time: Option<f64>,
    pub quality_selection: String,
    pub bandwidth: u64,
    pub position: u64,
    pub size: u64,
    pub segment_bitrate: u64,
    pub url: String,
    pub slope_diagnostics: Option<SlopeDiagnostics>,
}

impl AnalyzerSegment {
    pub fn ratio(&self) -> f64 {
        if self.size == 0 {
            0.0
        } else {
            self.position as f64 / self.size as f64
        }
    }
}

struct AnalyzerState {
    buffer_levels: Vec<(f64, f64)>,
    throughputs: Vec<(f64, u64)>,
    states: Vec<(f64, PlayerState)>,
    segments: Vec<AnalyzerSegment>,
    current_segment: Option<AnalyzerSegment>,
}

pub struct PlaybackAnalyzer {
    mpd_provider: Arc<MpdProvider>,
    clock: SharedClock,
    start_time: std::time::Instant,
    state: Mutex<AnalyzerState>,
}

impl PlaybackAnalyzer {
    pub fn new(mpd_provider: Arc<MpdProvider>, clock: SharedClock) -> Self {
        let start_time = clock.now();
        Self {
            mpd_provider,
            clock,
            start_time,
            state: Mutex::new(AnalyzerState {
                buffer_levels: Vec::new(),
                throughputs: Vec::new(),
                states: Vec::new(),
                segments: Vec::new(),
                current_segment: None,
            }),
        }
    }

    fn seconds_since_start(&self) -> f64 {
        self.clock.now().saturating_duration_since(self.start_time).as_secs_f64()
    }

    /// Only works for a single-video-adaptation-set manifest, matching
    /// `_get_video_representation`'s source-level restriction.
    async fn video_bitrate(&self, representation_id: &str) -> Option<u64> {
        let mpd = self.mpd_provider.mpd().await?;
        if mpd.adaptation_sets.len() != 1 {
            return None;
        }
        let adaptation_set = mpd.adaptation_sets.values().find(|a| a.content_type == "video")?;
        adaptation_set.representation(representation_id).map(|r| r.bandwidth)
    }

    pub async fn save(&self, mut output: impl Write, dump_results_path: Option<&str>) -> std::io::Result<()> {
        let (segments, states) = {
            let state = self.state.lock().unwrap();
            (state.segments.clone(), state.states.clone())
        };

        let mut last_quality: Option<String> = None;
        let mut quality_switches = 0;
        let mut bitrates = Vec::new();

        writeln!(output, "{:<10}{:<10}{:<10}{:<10}{:<10}{:<10}{:<10}{:<20}", "Index", "Start", "End", "Quality", "Bitrate", "Throughput", "Ratio", "URL")?;

        let mut resolved_segments = Vec::with_capacity(segments.len());
        for mut segment in segments {
            if let Some(last) = &last_quality {
                if last != &segment.quality_selection {
                    quality_switches += 1;
                }
            }
            last_quality = Some(segment.quality_selection.clone());

            let bitrate = self.video_bitrate(&segment.quality_selection).await.unwrap_or(0);
            segment.segment_bitrate = bitrate;
            bitrates.push(bitrate);

            writeln!(
                output,
                "{:<10}{:<10.2}{:<10.2}{:<10}{:<10}{:<10}{:<10.2}{:<20}",
                segment.index,
                segment.start_time,
                segment.completion_time.unwrap_or(0.0),
                segment.quality_selection,
                bitrate,
                segment.bandwidth,
                segment.ratio(),
                segment.url,
            )?;
            resolved_segments.push(segment);
        }
        writeln!(output)?;

        writeln!(output, "Stalls:")?;
        writeln!(output, "{:<10}{:<10}{:<10}", "Start", "End", "Duration")?;
        let mut buffering_start: Option<f64> = None;
        let mut stall_info_list = Vec::new();
        for &(time, state) in &states {
            match state {
                PlayerState::Buffering => buffering_start = Some(time),
                PlayerState::Ready => {
                    if let Some(start) = buffering_start.take() {
                        let duration = time - start;
                        writeln!(output, "{start:<10.2}{time:<10.2}{duration:<10.2}")?;
                        stall_info_list.push((start, time, duration));
                    }
                }
                _ => {}
            }
        }
        writeln!(output)?;

        let total_stall_num = stall_info_list.len();
        let total_stall_duration: f64 = stall_info_list.iter().map(|(_, _, d)| d).sum();
        writeln!(output, "Number of Stalls: {total_stall_num}")?;
        writeln!(output, "Total seconds of stalls: {total_stall_duration}")?;

        let average_bitrate = if bitrates.is_empty() {
            0.0
        } else {
            bitrates.iter().sum::<u64>() as f64 / bitrates.len() as f64
        };
        writeln!(output, "Average bitrate: {average_bitrate:.2} bps")?;
        writeln!(output, "Number of quality switches: {quality_switches}")?;
        writeln!(output)?;

        if let Some(path) = dump_results_path {
            self.dump_results(path, &resolved_segments, total_stall_num, total_stall_duration, average_bitrate, quality_switches)?;
        }

        Ok(())
    }

    fn dump_results(
        &self,
        path: &str,
        segments: &[AnalyzerSegment],
        num_stall: usize,
        dur_stall: f64,
        avg_bitrate: f64,
        num_quality_switches: usize,
    ) -> std::io::Result<()> {
        #[derive(Serialize)]
        struct SegmentJson<'a> {
            index: u64,
            start: f64,
            end: Option<f64>,
            quality: &'a str,
            bitrate: u64,
            throughput: u64,
            ratio: f64,
            url: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            slope_diagnostics: &'a Option<SlopeDiagnostics>,
        }

        #[derive(Serialize)]
        struct ResultsJson<'a> {
            segments: Vec<SegmentJson<'a>>,
            num_stall: usize,
            dur_stall: f64,
            avg_bitrate: f64,
            num_quality_switches: usize,
        }

        let data = ResultsJson {
            segments: segments
                .iter()
                .map(|s| SegmentJson {
                    index: s.index,
                    start: s.start_time,
                    end: s.completion_time,
                    quality: &s.quality_selection,
                    bitrate: s.segment_bitrate,
                    throughput: s.bandwidth,
                    ratio: s.ratio(),
                    url: &s.url,
                    slope_diagnostics: &s.slope_diagnostics,
                })
                .collect(),
            num_stall,
            dur_stall,
            avg_bitrate,
            num_quality_switches,
        };

        let mut extra_index = 1;
        let mut final_path = format!("{path}-{extra_index}.json");
        while std::path::Path::new(&final_path).exists() {
            extra_index += 1;
            final_path = format!("{path}-{extra_index}.json");
        }
        std::fs::write(&final_path, serde_json::to_vec(&data)?)?;
        tracing::info!("Dumped results to {final_path}");
        Ok(())
    }
}

impl ProgressSink for PlaybackAnalyzer {
    fn on_transfer_start(&self, url: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(mut segment) = state.current_segment.take() {
            segment.url = url.to_string();
            state.current_segment = Some(segment);
        }
    }

    fn on_bytes_transferred(&self, _length: u64, url: &str, position: u64, size: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(segment) = &mut state.current_segment {
            if segment.url == url {
                segment.position = position;
                segment.size = size;
            }
        }
    }
}

impl BandwidthSink for PlaybackAnalyzer {
    fn on_bandwidth_update(&self, bw_bits_per_second: u64) {
        let t = self.seconds_since_start();
        self.state.lock().unwrap().throughputs.push((t, bw_bits_per_second));
    }
}

impl StateSink for PlaybackAnalyzer {
    fn on_buffer_level_change(&self, buffer_level: f64) {
        let t = self.seconds_since_start();
        self.state.lock().unwrap().buffer_levels.push((t, buffer_level));
    }

    fn on_state_change(&self, state: PlayerState) {
        let t = self.seconds_since_start();
        self.state.lock().unwrap().states.push((t, state));
    }
}

impl SchedulerObserver for PlaybackAnalyzer {
    fn on_segment_download_start(&self, index: u64, selections: &Selection) {
        let mut state = self.state.lock().unwrap();
        let throughput = state.throughputs.last().map(|(_, bw)| *bw).unwrap_or(0);
        let quality_selection = selections.values().next().cloned().unwrap_or_default();
        state.current_segment = Some(AnalyzerSegment {
            index,
            start_time: self.seconds_since_start(),
            completion_time: None,
            quality_selection,
            bandwidth: throughput,
            position: 0,
            size: 0,
            segment_bitrate: 0,
            url: String::new(),
            slope_diagnostics: None,
        });
    }

    fn on_segment_download_complete(&self, index: u64) {
        let completion_time = self.seconds_since_start();
        let mut state = self.state.lock().unwrap();
        if let Some(mut segment) = state.current_segment.take() {
            segment.completion_time = Some(completion_time);
            debug_assert_eq!(segment.index, index);
            state.segments.push(segment);
        }
    }

    fn on_slope_diagnostics(&self, index: u64, before: &Selection, after: &Selection, slope: f64) {
        let mut state = self.state.lock().unwrap();
        if let Some(segment) = &mut state.current_segment {
            if segment.index == index {
                segment.slope_diagnostics = Some(SlopeDiagnostics {
                    selection_before_logic: before.clone(),
                    selection_after_logic: after.clone(),
                    slope_value: slope,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::download::DownloadManager;
    use crate::error::{ManifestError, TransportError};
    use crate::models::DownloadOutcome;
    use async_trait::async_trait;

    struct EmptyDownloadManager;

    #[async_trait]
    impl DownloadManager for EmptyDownloadManager {
        async fn download(&self, _url: &str) {}
        async fn wait_complete(&self, _url: &str) -> Result<DownloadOutcome, TransportError> {
            Ok(DownloadOutcome::Dropped)
        }
        async fn stop(&self, _url: &str) {}
        async fn drop_url(&self, _url: &str) {}
        fn cancel_read(&self, _url: &str) {}
        async fn close(&self) {}
    }

    fn analyzer() -> PlaybackAnalyzer {
        let mpd_provider = Arc::new(MpdProvider::new("http://example.test/manifest.mpd", Arc::new(EmptyDownloadManager)));
        let clock: SharedClock = Arc::new(MockClock::new());
        PlaybackAnalyzer::new(mpd_provider, clock)
    }

    #[test]
    fn records_a_completed_segment() {
        let analyzer = analyzer();
        let mut selections = Selection::new();
        selections.insert(0, "lo".to_string());

        analyzer.on_segment_download_start(0, &selections);
        analyzer.on_transfer_start("http://example.test/seg-0.m4s");
        analyzer.on_bytes_transferred(1000, "http://example.test/seg-0.m4s", 1000, 2000);
        analyzer.on_segment_download_complete(0);

        let state = analyzer.state.lock().unwrap();
        assert_eq!(state.segments.len(), 1);
        assert_eq!(state.segments[0].url, "http://example.test/seg-0.m4s");
        assert_eq!(state.segments[0].ratio(), 0.5);
    }

    #[tokio::test]
    async fn save_writes_textual_report_without_panicking() {
        let analyzer = analyzer();
        let mut selections = Selection::new();
        selections.insert(0, "lo".to_string());
        analyzer.on_segment_download_start(0, &selections);
        analyzer.on_transfer_start("http://example.test/seg-0.m4s");
        analyzer.on_bytes_transferred(2000, "http://example.test/seg-0.m4s", 2000, 2000);
        analyzer.on_segment_download_complete(0);

        let mut buf = Vec::new();
        analyzer.save(&mut buf, None).await.unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("Index"));
        assert!(text.contains("Number of Stalls"));
    }

    #[allow(dead_code)]
    fn silence_unused_manifest_error(_: ManifestError) {}
}
