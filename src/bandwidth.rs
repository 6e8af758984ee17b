//! Bandwidth Meter. Exponentially-smoothed byte-throughput estimator,
//! generalized from `dash_player::segment::fetcher::BandwidthEstimator` into
//! an event-driven contract: it consumes `on_bytes_transferred`/wall-clock
//! ticks rather than being handed a completed-fetch duration directly, and
//! emits periodic `BandwidthSink` notifications instead of only exposing a
//! getter.

use crate::clock::SharedClock;
use std::sync::Mutex;
use std::time::Duration;

/// Capability the core depends on for bandwidth updates: a named capability
/// interface rather than a polymorphic listener list.
pub trait BandwidthSink: Send + Sync {
    fn on_bandwidth_update(&self, bw_bits_per_second: u64);
}

struct WindowState {
    window_start: std::time::Instant,
    window_bytes: u64,
    ewma: f64,
    initialized: bool,
}

/// EWMA bandwidth estimator with a fixed measurement window.
pub struct BandwidthMeter {
    alpha: f64,
    window: Duration,
    initial_estimate_bps: f64,
    state: Mutex<WindowState>,
    clock: SharedClock,
}

impl BandwidthMeter {
    pub fn new(alpha: f64, window: Duration, initial_estimate_bps: f64, clock: SharedClock) -> Self {
        Self {
            alpha,
            window,
            initial_estimate_bps,
            state: Mutex::new(WindowState {
                window_start: clock.now(),
                window_bytes: 0,
                ewma: 0.0,
                initialized: false,
            }),
            clock,
        }
    }

    /// Record bytes received for a progress event. Returns `Some(bw)` when a
    /// measurement window has just closed and a fresh estimate is available
    /// to forward to `BandwidthSink` listeners.
    pub fn on_bytes_transferred(&self, length: u64) -> Option<u64> {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        state.window_bytes += length;

        let elapsed = now.saturating_duration_since(state.window_start);
        if elapsed < self.window {
            return None;
        }

        let sample = (state.window_bytes as f64 * 8.0) / elapsed.as_secs_f64();
        state.ewma = if state.initialized {
            self.alpha * sample + (1.0 - self.alpha) * state.ewma
        } else {
            state.initialized = true;
            sample
        };
        state.window_bytes = 0;
        state.window_start = now;
        Some(state.ewma.round() as u64)
    }

    /// Current estimate. Before the first window closes, returns the
    /// configured initial constant.
    pub fn estimate(&self) -> u64 {
        let state = self.state.lock().unwrap();
        if state.initialized {
            state.ewma.round() as u64
        } else {
            self.initial_estimate_bps.round() as u64
        }
    }
}

/// Adapts the meter into a [`crate::download::ProgressSink`], fanning the
/// resulting `BandwidthSink` notifications out to whichever components
/// (BETA governor, analyzer) need the periodic estimate. Kept separate from
/// `BandwidthMeter` itself so the meter's own unit tests stay free of the
/// download-manager wiring.
pub struct BandwidthMeterSink {
    meter: std::sync::Arc<BandwidthMeter>,
    listeners: Vec<std::sync::Arc<dyn BandwidthSink>>,
}

impl BandwidthMeterSink {
    pub fn new(meter: std::sync::Arc<BandwidthMeter>, listeners: Vec<std::sync::Arc<dyn BandwidthSink>>) -> Self {
        Self { meter, listeners }
    }
}

impl crate::download::ProgressSink for BandwidthMeterSink {
    fn on_bytes_transferred(&self, length: u64, _url: &str, _position: u64, _size: u64) {
        if let Some(bw) = self.meter.on_bytes_transferred(length) {
            for listener in &self.listeners {
                listener.on_bandwidth_update(bw);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use std::sync::Arc;

    #[test]
    fn initial_estimate_until_first_window_closes() {
        let clock: SharedClock = Arc::new(MockClock::new());
        let meter = BandwidthMeter::new(0.25, Duration::from_millis(500), 1_000_000.0, clock);
        assert_eq!(meter.estimate(), 1_000_000);
        assert_eq!(meter.on_bytes_transferred(1000), None);
        assert_eq!(meter.estimate(), 1_000_000);
    }

    #[test]
    fn window_close_produces_estimate() {
        let clock = Arc::new(MockClock::new());
        let shared: SharedClock = clock.clone();
        let meter = BandwidthMeter::new(0.5, Duration::from_millis(500), 1_000_000.0, shared);
        meter.on_bytes_transferred(50_000);
        clock.advance(Duration::from_millis(500));
        let bw = meter.on_bytes_transferred(0).expect("window should have closed");
        // 50_000 bytes * 8 bits / 0.5s = 800_000 bps, first sample == ewma.
        assert_eq!(bw, 800_000);
        assert_eq!(meter.estimate(), 800_000);
    }
}
