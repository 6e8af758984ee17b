//! MPD manifest data model and provider. Parsing is grounded on
//! `dash_player::mpd::parser`, extended to resolve `SegmentTemplate`/
//! `SegmentTimeline` addressing down to a concrete, indexable segment list
//! per representation: for a fixed adaptation set, all representations carry
//! the same number of segments and the same per-index duration.

pub mod parser;
pub mod provider;

pub use provider::MpdProvider;
