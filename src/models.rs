//! Core data model: representations, segments, segment requests, download
//! state, and player state, shared between the scheduler, the download
//! manager and the BETA governor.

use std::collections::HashMap;

/// One quality tier within an adaptation set.
#[derive(Debug, Clone)]
pub struct Representation {
    pub id: String,
    /// Average bandwidth in bits per second.
    pub bandwidth: u64,
    pub initialization_url: String,
    /// Concrete, indexable segment list. The MPD provider resolves
    /// `SegmentTemplate`/`SegmentTimeline` addressing down to this list so the
    /// scheduler and governor never need to know about `$Number$`/`$Time$`.
    pub segments: Vec<Segment>,
}

/// A fixed-duration media chunk belonging to exactly one representation.
#[derive(Debug, Clone)]
pub struct Segment {
    pub index: u64,
    pub url: String,
    pub duration: f64,
}

/// A group of interchangeable representations of the same media component.
#[derive(Debug, Clone)]
pub struct AdaptationSet {
    pub id: u64,
    pub content_type: String,
    pub representations: HashMap<String, Representation>,
}

impl AdaptationSet {
    pub fn representation(&self, id: &str) -> Option<&Representation> {
        self.representations.get(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestType {
    Static,
    Dynamic,
}

/// Parsed-and-resolved manifest: adaptation sets plus whether refresh is needed.
#[derive(Debug, Clone)]
pub struct Mpd {
    pub manifest_type: ManifestType,
    pub minimum_update_period: Option<f64>,
    pub adaptation_sets: HashMap<u64, AdaptationSet>,
}

/// The in-flight or pending record of a fetch.
#[derive(Debug, Clone)]
pub struct SegmentRequest {
    pub index: u64,
    pub url: Option<String>,
    pub first_bytes_received: bool,
}

impl SegmentRequest {
    pub fn new(index: u64) -> Self {
        Self {
            index,
            url: None,
            first_bytes_received: false,
        }
    }
}

/// Per-URL download state automaton: `Idle -> Opening -> Streaming ->
/// {Completed | Stopped | Dropped}`. Terminal states are absorbing.
/// Collapses the original's several per-URL sets (`_completed_urls`,
/// `_partially_accepted_urls`, `_cancelled_urls`, ...) into one tagged enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadState {
    Idle,
    Opening,
    Streaming { position: u64, size: u64 },
    Completed { size: u64 },
    Stopped { position: u64, size: u64 },
    Dropped,
}

impl DownloadState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadState::Completed { .. } | DownloadState::Stopped { .. } | DownloadState::Dropped
        )
    }
}

/// Player playback state, observed by the BETA governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Ready,
    Buffering,
    Stalled,
    End,
}

/// Capability the core depends on for player-reported state: a named
/// capability interface rather than the original's `PlayerEventListener`
/// mixin.
pub trait StateSink: Send + Sync {
    fn on_buffer_level_change(&self, buffer_level: f64) {
        let _ = buffer_level;
    }
    fn on_state_change(&self, state: PlayerState) {
        let _ = state;
    }
}

/// Outcome of `wait_complete`: `Completed`/`Stopped` both yield bytes (the
/// latter only the received prefix); `Dropped` yields nothing. Kept as a
/// named type at the public API boundary; the scheduler's original `results
/// is None` check is preserved via `into_option`.
#[derive(Debug, Clone)]
pub enum DownloadOutcome {
    Completed { data: bytes::Bytes, size: u64 },
    Stopped { data: bytes::Bytes, size: u64 },
    Dropped,
}

impl DownloadOutcome {
    pub fn into_option(self) -> Option<(bytes::Bytes, u64)> {
        match self {
            DownloadOutcome::Completed { data, size } | DownloadOutcome::Stopped { data, size } => {
                Some((data, size))
            }
            DownloadOutcome::Dropped => None,
        }
    }
}
