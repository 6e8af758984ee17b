//! Buffer occupancy: a scalar seconds-of-decoded-media value owned by the
//! player, read-only to the scheduler/governor. Grounded on
//! `original_source/dash_emulator/buffer.py::BufferManagerImpl` (not itself
//! in the retrieved pack, behavior inferred from its call sites in
//! `scheduler.py`: `buffer_level` getter, `enqueue_buffer(duration)`).
//!
//! The real player's frame decode/drain side is an external collaborator;
//! this is the minimal read/write surface the scheduler and governor need.

use std::sync::atomic::{AtomicU64, Ordering};

pub struct BufferManager {
    buffer_level_millis: AtomicU64,
}

impl Default for BufferManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferManager {
    pub fn new() -> Self {
        Self {
            buffer_level_millis: AtomicU64::new(0),
        }
    }

    pub fn buffer_level(&self) -> f64 {
        self.buffer_level_millis.load(Ordering::Acquire) as f64 / 1000.0
    }

    pub fn enqueue_buffer(&self, duration_secs: f64) {
        let added = (duration_secs.max(0.0) * 1000.0).round() as u64;
        self.buffer_level_millis.fetch_add(added, Ordering::AcqRel);
    }

    /// Drains buffered seconds as playback consumes them; the player
    /// collaborator this crate doesn't implement would call this on a
    /// decode-rate timer.
    pub fn drain(&self, duration_secs: f64) {
        let removed = (duration_secs.max(0.0) * 1000.0).round() as u64;
        self.buffer_level_millis.fetch_update(Ordering::AcqRel, Ordering::Acquire, |level| Some(level.saturating_sub(removed))).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_and_drain_round_trip() {
        let buffer = BufferManager::new();
        assert_eq!(buffer.buffer_level(), 0.0);
        buffer.enqueue_buffer(4.0);
        buffer.enqueue_buffer(2.0);
        assert_eq!(buffer.buffer_level(), 6.0);
        buffer.drain(1.5);
        assert_eq!(buffer.buffer_level(), 4.5);
    }
}
