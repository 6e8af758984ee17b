//! BETA event stream, grounded on
//! `original_source/dash_emulator_quic/beta/events.py`.

use crate::abr::Selection;
use crate::models::PlayerState;

#[derive(Debug, Clone)]
pub enum BetaEvent {
    BandwidthUpdate { bw_bps: u64 },
    BufferLevelChange { buffer_level: f64 },
    StateChange { state: PlayerState },
    SegmentDownloadStart { index: u64, selections: Selection },
    SegmentDownloadComplete { index: u64 },
    TransferStart { url: String },
    BytesTransferred { length: u64, url: String, position: u64, size: u64 },
    TransferEnd { size: u64, url: String },
    TransferCanceled { url: String, position: u64, size: u64 },
}
