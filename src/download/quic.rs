//! HTTP/3-on-QUIC download manager, grounded on
//! `original_source/dash_emulator_quic/downloader/quic/client.py::QuicClientImpl`.
//! One `quinn::Endpoint`/`h3` connection multiplexes all concurrent GETs;
//! `stop(url)` resets only that request's stream, never the connection.
//!
//! 0-RTT session resumption, where the server permits it, is carried by
//! rustls' client session-ticket cache on the `quinn::ClientConfig`, the
//! Rust analogue of the original's `save_session_ticket`/`SessionTicket`
//! plumbing.

use super::{DownloadManager, ProgressSink};
use crate::error::TransportError;
use crate::models::DownloadOutcome;
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use h3::client::SendRequest;
use h3_quinn::{Connection as H3QuinnConnection, OpenStreams};
use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Terminal {
    Completed,
    Stopped,
    Dropped,
}

/// What the poll loop in `run_download` should do on its next iteration,
/// checked both before and immediately after each `recv_data().await` so a
/// chunk that arrives while a stop/drop/cancel-read is in flight never
/// reaches a sink.
enum RequestedAction {
    Continue,
    Finish(Terminal),
    ReleaseWithoutFinish,
}

fn requested_action(stop_requested: &AtomicBool, drop_requested: &AtomicBool, reader_released: &AtomicBool) -> RequestedAction {
    if drop_requested.load(Ordering::Acquire) {
        RequestedAction::Finish(Terminal::Dropped)
    } else if stop_requested.load(Ordering::Acquire) {
        RequestedAction::Finish(Terminal::Stopped)
    } else if reader_released.load(Ordering::Acquire) {
        RequestedAction::ReleaseWithoutFinish
    } else {
        RequestedAction::Continue
    }
}

struct UrlSlot {
    buffer: BytesMut,
    size: u64,
    terminal: Option<Terminal>,
    /// Only set for a connect/request-level failure that never produced a
    /// single byte; `wait_complete` surfaces this instead of `Dropped`.
    connect_error: Option<TransportError>,
    stop_requested: Arc<AtomicBool>,
    drop_requested: Arc<AtomicBool>,
    reader_released: Arc<AtomicBool>,
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
            stop_requested: Arc::new(AtomicBool::new(false)),
            drop_requested: Arc::new(AtomicBool::new(false)),
            reader_released: Arc::new(AtomicBool::new(false)),
            suppress_bytes: false,
            terminal_tx,
        }
    }
}

/// Multiplexed HTTP/3 client: `is_busy` is always false, because QUIC
/// supports concurrent streams on one connection.
pub struct QuicDownloadManager {
    send_request: tokio::sync::Mutex<Option<SendRequest<OpenStreams, Bytes>>>,
    endpoint: tokio::sync::Mutex<Option<quinn::Endpoint>>,
    origin: String,
    sinks: Vec<Arc<dyn ProgressSink>>,
    slots: Mutex<HashMap<String, UrlSlot>>,
    queue_tx: mpsc::UnboundedSender<String>,
}

impl QuicDownloadManager {
    pub fn new(origin: impl Into<String>, sinks: Vec<Arc<dyn ProgressSink>>) -> Arc<Self> {
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<String>();
        let manager = Arc::new(Self {
            send_request: tokio::sync::Mutex::new(None),
            endpoint: tokio::sync::Mutex::new(None),
            origin: origin.into(),
            sinks,
            slots: Mutex::new(HashMap::new()),
            queue_tx,
        });

        let worker = manager.clone();
        tokio::spawn(async move {
            // Unlike the TCP transport, H3 multiplexes freely: each dequeued
            // URL gets its own task rather than running single-flight.
            while let Some(url) = queue_rx.recv().await {
                let this = worker.clone();
                tokio::spawn(async move { this.run_download(url).await });
            }
        });

        manager
    }

    async fn ensure_connected(&self) -> Result<SendRequest<OpenStreams, Bytes>, TransportError> {
        {
            let guard = self.send_request.lock().await;
            if let Some(sr) = guard.as_ref() {
                return Ok(sr.clone());
            }
        }

        let url = url::Url::parse(&self.origin).map_err(|e| TransportError::Connect {
            url: self.origin.clone(),
            reason: e.to_string(),
        })?;
        let host = url.host_str().ok_or_else(|| TransportError::Connect {
            url: self.origin.clone(),
            reason: "missing host".to_string(),
        })?;
        let port = url.port().unwrap_or(443);

        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| TransportError::Connect {
                url: self.origin.clone(),
                reason: e.to_string(),
            })?
            .next()
            .ok_or_else(|| TransportError::Connect {
                url: self.origin.clone(),
                reason: "DNS resolution returned no addresses".to_string(),
            })?;

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots_certs());
        let mut crypto = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        crypto.alpn_protocols = vec![b"h3".to_vec()];
        // rustls' session-ticket cache (default-enabled) is the 0-RTT /
        // resumption mechanism.

        let client_config = quinn::ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto).map_err(|e| TransportError::Connect {
                url: self.origin.clone(),
                reason: e.to_string(),
            })?,
        ));

        let mut endpoint = quinn::Endpoint::client("0.0.0.0:0".parse().unwrap()).map_err(|e| TransportError::Connect {
            url: self.origin.clone(),
            reason: e.to_string(),
        })?;
        endpoint.set_default_client_config(client_config);

        let connection = endpoint
            .connect(addr, host)
            .map_err(|e| TransportError::Connect {
                url: self.origin.clone(),
                reason: e.to_string(),
            })?
            .await
            .map_err(|e| TransportError::Connect {
                url: self.origin.clone(),
                reason: e.to_string(),
            })?;

        let h3_conn = H3QuinnConnection::new(connection);
        let (mut driver, send_request) = h3::client::new(h3_conn).await.map_err(|e| TransportError::Connect {
            url: self.origin.clone(),
            reason: e.to_string(),
        })?;

        tokio::spawn(async move {
            if let Err(e) = std::future::poll_fn(|cx| driver.poll_close(cx)).await {
                warn!("H3 connection driver closed: {e}");
            }
        });

        *self.send_request.lock().await = Some(send_request.clone());
        *self.endpoint.lock().await = Some(endpoint);
        Ok(send_request)
    }

    async fn run_download(self: Arc<Self>, url: String) {
        for sink in &self.sinks {
            sink.on_transfer_start(&url);
        }

        let mut send_request = match self.ensure_connected().await {
            Ok(sr) => sr,
            Err(e) => {
                error!("QUIC connect failed for {url}: {e}");
                self.fail(&url, e);
                return;
            }
        };

        let (stop_requested, drop_requested, reader_released) = {
            let mut slots = self.slots.lock().unwrap();
            let slot = slots.entry(url.clone()).or_insert_with(UrlSlot::new);
            (
                slot.stop_requested.clone(),
                slot.drop_requested.clone(),
                slot.reader_released.clone(),
            )
        };

        let request = match http::Request::builder().uri(url.as_str()).body(()) {
            Ok(r) => r,
            Err(e) => {
                let err = TransportError::Request { url: url.clone(), reason: format!("malformed request URI: {e}") };
                error!("{err}");
                self.finish(&url, Terminal::Dropped);
                return;
            }
        };

        let mut stream = match send_request.send_request(request).await {
            Ok(s) => s,
            Err(e) => {
                let err = TransportError::Request { url: url.clone(), reason: e.to_string() };
                error!("{err}");
                self.finish(&url, Terminal::Dropped);
                return;
            }
        };

        if let Err(e) = stream.finish().await {
            let err = TransportError::Request { url: url.clone(), reason: e.to_string() };
            error!("{err}");
            self.finish(&url, Terminal::Dropped);
            return;
        }

        let size = match stream.recv_response().await {
            Ok(resp) => resp
                .headers()
                .get(http::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0),
            Err(e) => {
                let err = TransportError::Request { url: url.clone(), reason: e.to_string() };
                error!("{err}");
                self.finish(&url, Terminal::Dropped);
                return;
            }
        };
        {
            let mut slots = self.slots.lock().unwrap();
            if let Some(slot) = slots.get_mut(&url) {
                slot.size = size;
            }
        }

        loop {
            match requested_action(&stop_requested, &drop_requested, &reader_released) {
                RequestedAction::Finish(terminal) => {
                    let code = match terminal {
                        Terminal::Dropped => h3::error::Code::H3_REQUEST_CANCELLED,
                        _ => h3::error::Code::H3_NO_ERROR,
                    };
                    let _ = stream.stop_stream(code);
                    self.finish(&url, terminal);
                    return;
                }
                RequestedAction::ReleaseWithoutFinish => return,
                RequestedAction::Continue => {}
            }

            match stream.recv_data().await {
                Ok(Some(mut chunk)) => {
                    // A chunk may already have arrived by the time
                    // stop()/drop_url()/cancel_read() flips its flag; re-check
                    // immediately before handing it to `on_chunk` so it never
                    // reaches a sink once the loop has been told to stop.
                    match requested_action(&stop_requested, &drop_requested, &reader_released) {
                        RequestedAction::Finish(terminal) => {
                            let code = match terminal {
                                Terminal::Dropped => h3::error::Code::H3_REQUEST_CANCELLED,
                                _ => h3::error::Code::H3_NO_ERROR,
                            };
                            let _ = stream.stop_stream(code);
                            self.finish(&url, terminal);
                            return;
                        }
                        RequestedAction::ReleaseWithoutFinish => return,
                        RequestedAction::Continue => {}
                    }
                    let length = chunk.remaining();
                    let bytes = chunk.copy_to_bytes(length);
                    self.on_chunk(&url, bytes, size);
                }
                Ok(None) => break,
                Err(e) => {
                    let reset = TransportError::Reset { url: url.clone() };
                    error!("H3 stream for {url} failed mid-transfer: {e} ({reset})");
                    self.finish(&url, Terminal::Dropped);
                    return;
                }
            }
        }
        self.finish(&url, Terminal::Completed);
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
impl DownloadManager for QuicDownloadManager {
    async fn download(&self, url: &str) {
        self.slots.lock().unwrap().entry(url.to_string()).or_insert_with(UrlSlot::new);
        if self.queue_tx.send(url.to_string()).is_err() {
            error!("QUIC download queue is closed, dropping request for {url}");
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
        info!("STOP DOWNLOADING (QUIC): {url}");
        let flag = {
            let slots = self.slots.lock().unwrap();
            slots.get(url).map(|s| s.stop_requested.clone())
        };
        if let Some(flag) = flag {
            flag.store(true, Ordering::Release);
        }
    }

    async fn drop_url(&self, url: &str) {
        {
            let mut slots = self.slots.lock().unwrap();
            let slot = slots.entry(url.to_string()).or_insert_with(UrlSlot::new);
            slot.suppress_bytes = true;
            slot.drop_requested.store(true, Ordering::Release);
        }
        // Force-resolve immediately rather than waiting for `run_download`'s
        // poll loop to notice `drop_requested`: that loop may be parked
        // inside `recv_data().await` against an idle peer and never wake on
        // its own. The background task still reaches the flag on its next
        // poll and resets the H3 stream there; `resolve` is idempotent so
        // that later call is a no-op once we've already settled the slot.
        self.finish(url, Terminal::Dropped);
    }

    fn cancel_read(&self, url: &str) {
        let flag = {
            let slots = self.slots.lock().unwrap();
            slots.get(url).map(|s| s.reader_released.clone())
        };
        if let Some(flag) = flag {
            flag.store(true, Ordering::Release);
        }
    }

    async fn close(&self) {
        if let Some(endpoint) = self.endpoint.lock().await.take() {
            endpoint.close(0u32.into(), b"done");
            endpoint.wait_idle().await;
        }
    }
}

fn webpki_roots_certs() -> impl Iterator<Item = rustls::pki_types::TrustAnchor<'static>> {
    webpki_roots::TLS_SERVER_ROOTS.iter().cloned()
}
