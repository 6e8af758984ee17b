//! ABR Selector: wraps an injected bandwidth-based selector and
//! adds a single behavioural axis, `choose_lowest`, with an O(1) per-
//! adaptation-set cache of the minimum-bandwidth representation.
//!
//! The bandwidth-based selection itself is grounded on
//! `dash_player::player::select_representation`, generalized from a flat
//! `&[Representation]` slice to the `AdaptationSet` map this crate's MPD
//! model uses, and on `original_source/dash_emulator_quic/abr.py::BetaABRController`
//! for the choose-lowest/caching behaviour.

use crate::models::{AdaptationSet, Mpd, Representation};
use std::collections::HashMap;
use std::sync::Mutex;

/// The "dumb" selection policy the governor's buffer/ABR logic is built on
/// top of. The ABR bitrate-selection policy proper is a pluggable collaborator,
/// not this crate's concern; a reasonable default is enough to exercise the
/// rest of the pipeline against.
pub trait BandwidthSelector: Send + Sync {
    fn select<'a>(&self, adaptation_set: &'a AdaptationSet, estimated_bps: u64) -> &'a Representation;
}

/// Ported from `select_representation`: picks the representation whose
/// bandwidth is the closest to (and under, if any qualify) a 5%-derated
/// estimate.
pub struct DefaultBandwidthSelector {
    /// Fraction of the raw estimate actually budgeted to account for
    /// overhead, matching the teacher's hard-coded `0.95` multiplier.
    pub safety_factor: f64,
}

impl Default for DefaultBandwidthSelector {
    fn default() -> Self {
        Self { safety_factor: 0.95 }
    }
}

impl BandwidthSelector for DefaultBandwidthSelector {
    fn select<'a>(&self, adaptation_set: &'a AdaptationSet, estimated_bps: u64) -> &'a Representation {
        let budget = estimated_bps as f64 * self.safety_factor;
        let mut reps = adaptation_set.representations.values();
        let first = reps.next().expect("adaptation set has at least one representation");
        reps.fold(first, |a, b| {
            let a_under = a.bandwidth as f64 <= budget;
            let b_under = b.bandwidth as f64 <= budget;
            match (a_under, b_under) {
                (true, true) => {
                    if a.bandwidth > b.bandwidth {
                        a
                    } else {
                        b
                    }
                }
                (false, false) => {
                    if a.bandwidth < b.bandwidth {
                        a
                    } else {
                        b
                    }
                }
                (true, false) => a,
                (false, true) => b,
            }
        })
    }
}

/// A chosen representation id per adaptation set, keyed by adaptation-set id.
pub type Selection = HashMap<u64, String>;

pub struct AbrSelector {
    inner: Box<dyn BandwidthSelector>,
    lowest_cache: Mutex<HashMap<u64, String>>,
}

impl AbrSelector {
    pub fn new(inner: Box<dyn BandwidthSelector>) -> Self {
        Self {
            inner,
            lowest_cache: Mutex::new(HashMap::new()),
        }
    }

    /// `sel ← ABR.select(adaptation_sets, lowest = ...)` from the scheduler's
    /// per-segment selection loop.
    pub fn select(&self, mpd: &Mpd, estimated_bps: u64, choose_lowest: bool) -> Selection {
        mpd.adaptation_sets
            .iter()
            .map(|(&as_id, adaptation_set)| {
                let rep_id = if choose_lowest {
                    self.lowest_bandwidth_representation(as_id, adaptation_set)
                } else {
                    self.inner.select(adaptation_set, estimated_bps).id.clone()
                };
                (as_id, rep_id)
            })
            .collect()
    }

    fn lowest_bandwidth_representation(&self, as_id: u64, adaptation_set: &AdaptationSet) -> String {
        if let Some(cached) = self.lowest_cache.lock().unwrap().get(&as_id) {
            return cached.clone();
        }
        let lowest = adaptation_set
            .representations
            .values()
            .min_by_key(|rep| rep.bandwidth)
            .expect("adaptation set has at least one representation");
        let id = lowest.id.clone();
        self.lowest_cache.lock().unwrap().insert(as_id, id.clone());
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Segment;

    fn representation(id: &str, bandwidth: u64) -> Representation {
        Representation {
            id: id.to_string(),
            bandwidth,
            initialization_url: format!("{id}/init.mp4"),
            segments: vec![Segment {
                index: 0,
                url: format!("{id}/seg-0.m4s"),
                duration: 2.0,
            }],
        }
    }

    fn adaptation_set() -> AdaptationSet {
        let mut representations = HashMap::new();
        representations.insert("lo".to_string(), representation("lo", 500_000));
        representations.insert("mid".to_string(), representation("mid", 1_500_000));
        representations.insert("hi".to_string(), representation("hi", 4_000_000));
        AdaptationSet {
            id: 0,
            content_type: "video".to_string(),
            representations,
        }
    }

    #[test]
    fn bandwidth_selector_picks_under_budget_representation() {
        let selector = DefaultBandwidthSelector::default();
        let chosen = selector.select(&adaptation_set(), 1_600_000);
        assert_eq!(chosen.id, "mid");
    }

    #[test]
    fn bandwidth_selector_falls_back_to_lowest_when_budget_is_small() {
        let selector = DefaultBandwidthSelector::default();
        let chosen = selector.select(&adaptation_set(), 100_000);
        assert_eq!(chosen.id, "lo");
    }

    #[test]
    fn choose_lowest_is_cached_after_first_lookup() {
        let abr = AbrSelector::new(Box::new(DefaultBandwidthSelector::default()));
        let mut adaptation_sets = HashMap::new();
        adaptation_sets.insert(0, adaptation_set());
        let mpd = Mpd {
            manifest_type: crate::models::ManifestType::Static,
            minimum_update_period: None,
            adaptation_sets,
        };

        let first = abr.select(&mpd, 4_000_000, true);
        assert_eq!(first.get(&0).unwrap(), "lo");
        assert_eq!(abr.lowest_cache.lock().unwrap().len(), 1);

        let second = abr.select(&mpd, 4_000_000, true);
        assert_eq!(second.get(&0).unwrap(), "lo");
        assert_eq!(abr.lowest_cache.lock().unwrap().len(), 1);
    }
}
