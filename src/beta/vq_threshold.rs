//! Per-segment VQ threshold, grounded on
//! `original_source/dash_emulator_quic/beta/vq_threshold.py`.

/// Returns the ratio above which additional bytes for a segment contribute
/// only marginal perceptual quality; the governor stops once reached.
pub trait VqThresholdManager: Send + Sync {
    fn get_threshold(&self, index: u64) -> f64;
}

/// Flat threshold, matching the original's `MockVQThresholdManager`. A real
/// per-title VQ model is an external collaborator alongside the ABR
/// bitrate-selection policy proper.
pub struct FixedVqThresholdManager {
    pub threshold: f64,
}

impl Default for FixedVqThresholdManager {
    fn default() -> Self {
        Self { threshold: 0.8 }
    }
}

impl VqThresholdManager for FixedVqThresholdManager {
    fn get_threshold(&self, _index: u64) -> f64 {
        self.threshold
    }
}
