//! HTTP/1.1-on-TCP download manager, grounded on
//! `original_source/dash_emulator_quic/downloader/tcp/__init__.py::TCPClientImpl`
//! and `dash_player::segment::fetcher::fetch_segment` for the reqwest usage
//! pattern. One `reqwest::Client` session is shared; downloads are
//! serialized one-at-a-time on that session, as the original does with its
//! single `_download_queue`/`_download_task`.

use super::{DownloadManager, ProgressSink};
use crate::error::TransportError;
use crate::models::DownloadOutcome;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Terminal {
    Completed,
    Stopped,
    Dropped,
}

struct UrlSlot {
    buffer: BytesMut,
    size: u64,
    terminal: Option<Terminal>,
    /// Only set for a connect/request-level failure that never produced a
    /// single byte; `wait_complete` surfaces this instead of `Dropped`.
    connect_error: Option<TransportError>,
    cancel_requested: Arc<AtomicBool>,
    suppress_bytes: bool,
    terminal_tx: watch::Sender<Option<Terminal>>,
}

impl UrlSlot {
    fn new() -> Self {
        let (terminal_tx, _) = watch::channel(None);
        Self {
            buffer: BytesMut::new(),
            size: 0,
            terminal: None,
            connect_error: None,
            cancel_requested: Arc::new(AtomicBool::new(false)),
            suppress_bytes: false,
            terminal_tx,
        }
    }
}

pub struct TcpDownloadManager {
    client: reqwest::Client,
    sinks: Vec<Arc<dyn ProgressSink>>,
    slots: Mutex<HashMap<String, UrlSlot>>,
    queue_tx: mpsc::UnboundedSender<String>,
}

impl TcpDownloadManager {
    pub fn new(sinks: Vec<Arc<dyn ProgressSink>>) -> Arc<Self> {
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<String>();
        let manager = Arc::new(Self {
            client: reqwest::Client::new(),
            sinks,
            slots: Mutex::new(HashMap::new()),
            queue_tx,
        });

        let worker = manager.clone();
        tokio::spawn(async move {
            // Single-flight-per-session: one URL downloads at a time, matching
            // the TCP transport's `is_busy` semantics.
            while let Some(url) = queue_rx.recv().await {
                worker.run_download(url).await;
            }
        });

        manager
    }

    async fn run_download(&self, url: String) {
        for sink in &self.sinks {
            sink.on_transfer_start(&url);
        }

        let cancel_requested = {
            let mut slots = self.slots.lock().unwrap();
            let slot = slots.entry(url.clone()).or_insert_with(UrlSlot::new);
            slot.cancel_requested.clone()
        };

        let response = match self.client.get(&url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                let err = TransportError::Connect { url: url.clone(), reason: e.to_string() };
                error!("{err}");
                self.fail(&url, err);
                return;
            }
        };

        let size = response.content_length().unwrap_or(0);
        {
            let mut slots = self.slots.lock().unwrap();
            if let Some(slot) = slots.get_mut(&url) {
                slot.size = size;
            }
        }

        let mut stream = response.bytes_stream();
        loop {
            if cancel_requested.load(Ordering::Acquire) {
                break;
            }
            match stream.next().await {
                Some(Ok(chunk)) => {
                    // stop() may have flipped the flag while we were parked
                    // on `next().await`; re-check before forwarding so no
                    // byte-transfer event escapes after stop() has returned.
                    if cancel_requested.load(Ordering::Acquire) {
                        break;
                    }
                    self.on_chunk(&url, chunk, size);
                }
                Some(Err(e)) => {
                    let reset = TransportError::Reset { url: url.clone() };
                    error!("TCP stream for {url} failed mid-transfer: {e} ({reset})");
                    self.finish(&url, Terminal::Dropped);
                    return;
                }
                None => break,
            }
        }

        let terminal = if cancel_requested.load(Ordering::Acquire) {
            Terminal::Stopped
        } else {
            Terminal::Completed
        };
        self.finish(&url, terminal);
    }

    fn on_chunk(&self, url: &str, chunk: Bytes, size: u64) {
        let mut slots = self.slots.lock().unwrap();
        let slot = match slots.get_mut(url) {
            Some(s) => s,
            None => return,
        };
        if slot.suppress_bytes {
            return;
        }
        slot.buffer.extend_from_slice(&chunk);
        let position = slot.buffer.len() as u64;
        drop(slots);

        debug!("Bytes transferred: length={} position={} size={} url={}", chunk.len(), position, size, url);
        for sink in &self.sinks {
            sink.on_bytes_transferred(chunk.len() as u64, url, position, size);
        }
    }

    fn finish(&self, url: &str, terminal: Terminal) {
        self.resolve(url, terminal, None);
    }

    /// A connect/request-level failure: no bytes ever arrived, so the
    /// waiter gets a typed `Err` instead of a plain `Dropped` outcome.
    fn fail(&self, url: &str, err: TransportError) {
        self.resolve(url, Terminal::Dropped, Some(err));
    }

    fn resolve(&self, url: &str, terminal: Terminal, connect_error: Option<TransportError>) {
        let (size, terminal_tx) = {
            let mut slots = self.slots.lock().unwrap();
            let slot = match slots.get_mut(url) {
                Some(s) => s,
                None => return,
            };
            if slot.terminal.is_some() {
                // Already resolved, e.g. drop_url beat the worker task here.
                return;
            }
            slot.terminal = Some(terminal);
            slot.connect_error = connect_error;
            (slot.size, slot.terminal_tx.clone())
        };
        match terminal {
            Terminal::Completed | Terminal::Stopped => {
                for sink in &self.sinks {
                    sink.on_transfer_end(size, url);
                }
            }
            Terminal::Dropped => {
                let position = self.slots.lock().unwrap().get(url).map(|s| s.buffer.len() as u64).unwrap_or(0);
                for sink in &self.sinks {
                    sink.on_transfer_canceled(url, position, size);
                }
            }
        }
        let _ = terminal_tx.send(Some(terminal));
    }
}

#[async_trait]
impl DownloadManager for TcpDownloadManager {
    async fn download(&self, url: &str) {
        self.slots.lock().unwrap().entry(url.to_string()).or_insert_with(UrlSlot::new);
        if self.queue_tx.send(url.to_string()).is_err() {
            error!("TCP download queue is closed, dropping request for {url}");
        }
    }

    async fn wait_complete(&self, url: &str) -> Result<DownloadOutcome, TransportError> {
        loop {
            let mut rx = {
                let mut slots = self.slots.lock().unwrap();
                let slot = slots.entry(url.to_string()).or_insert_with(UrlSlot::new);
                if let Some(terminal) = slot.terminal {
                    if let Some(err) = slot.connect_error.take() {
                        slots.remove(url);
                        return Err(err);
                    }
                    let outcome = match terminal {
                        Terminal::Completed => DownloadOutcome::Completed {
                            data: slot.buffer.clone().freeze(),
                            size: slot.size,
                        },
                        Terminal::Stopped => DownloadOutcome::Stopped {
                            data: slot.buffer.clone().freeze(),
                            size: slot.size,
                        },
                        Terminal::Dropped => DownloadOutcome::Dropped,
                    };
                    slots.remove(url);
                    return Ok(outcome);
                }
                // Subscribing while still holding the slot lock is what
                // makes this race-free: `resolve()` can only send a terminal
                // value after it has itself acquired (and released) this
                // same lock, so no send can happen between our check above
                // and this subscription.
                slot.terminal_tx.subscribe()
            };
            let _ = rx.changed().await;
        }
    }

    async fn stop(&self, url: &str) {
        info!("STOP DOWNLOADING: {url}");
        let cancel_flag = {
            let slots = self.slots.lock().unwrap();
            slots.get(url).map(|s| s.cancel_requested.clone())
        };
        if let Some(flag) = cancel_flag {
            flag.store(true, Ordering::Release);
        }
    }

    async fn drop_url(&self, url: &str) {
        self.stop(url).await;
        {
            let mut slots = self.slots.lock().unwrap();
            if let Some(slot) = slots.get_mut(url) {
                slot.suppress_bytes = true;
            }
        }
        self.finish(url, Terminal::Dropped);
    }

    fn cancel_read(&self, _url: &str) {
        // TCP has no per-stream flow-control credit to reclaim; matches the
        // original `TCPClientImpl.cancel_read_url`, which is a no-op.
    }

    async fn close(&self) {
        // Dropping the manager drops the reqwest::Client and its connection
        // pool; nothing else is held open for the TCP transport.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_read_is_a_documented_noop() {
        // No observable behavior to assert beyond "doesn't panic" — this
        // guards the no-op contract the TCP path relies on.
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let manager = TcpDownloadManager::new(vec![]);
            manager.cancel_read("http://example.test/seg.m4s");
        });
    }
}
