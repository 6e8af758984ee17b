//! Download Manager: a uniform contract over HTTP/3-on-QUIC and
//! HTTP/1.1-on-TCP transports, with per-URL surgical cancellation.
//!
//! The original's dynamic, many-to-many listener lists become named
//! capability interfaces (`ProgressSink`) wired once at construction time
//! rather than registered/unregistered at runtime.

pub mod quic;
pub mod tcp;

use crate::error::TransportError;
use crate::models::DownloadOutcome;
use async_trait::async_trait;

/// Capability the download manager fans progress events out to. A download
/// manager is built with a fixed, small `Vec<Arc<dyn ProgressSink>>` — the
/// BETA governor, the bandwidth meter's adapter, and the playback analyzer
/// each implement this once, composed in rather than registered at runtime.
pub trait ProgressSink: Send + Sync {
    fn on_transfer_start(&self, url: &str) {
        let _ = url;
    }
    fn on_bytes_transferred(&self, length: u64, url: &str, position: u64, size: u64) {
        let _ = (length, url, position, size);
    }
    fn on_transfer_end(&self, size: u64, url: &str) {
        let _ = (size, url);
    }
    fn on_transfer_canceled(&self, url: &str, position: u64, size: u64) {
        let _ = (url, position, size);
    }
}

/// Uniform contract regardless of transport.
#[async_trait]
pub trait DownloadManager: Send + Sync {
    /// Enqueue a GET; returns immediately.
    async fn download(&self, url: &str);

    /// Blocks until the URL reaches a terminal state.
    async fn wait_complete(&self, url: &str) -> Result<DownloadOutcome, TransportError>;

    /// Force an early terminal on this URL's stream; the received prefix
    /// remains available to the waiter.
    async fn stop(&self, url: &str);

    /// Stronger than `stop`: the waiter observes `Dropped`, and subsequent
    /// bytes for this URL are suppressed.
    async fn drop_url(&self, url: &str);

    /// Release the reader side without signalling drop to the waiter —
    /// used to reclaim QUIC flow-control credit when the governor abandons a
    /// stream before the scheduler observes it.
    fn cancel_read(&self, url: &str);

    /// Close the whole connection/session cleanly.
    async fn close(&self);
}
