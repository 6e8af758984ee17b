//! MPD Provider, grounded on
//! `original_source/dash_emulator_quic/mpd/providers.py::BETAMPDProviderImpl`
//! and `dash_player::player::DashPlayer::refresh_mpd`. Fetches the manifest
//! through the download manager, parses it, and for dynamic manifests spawns
//! a periodic refresh task with a single-in-flight-refresh guarantee.

use crate::download::DownloadManager;
use crate::error::ManifestError;
use crate::models::{ManifestType, Mpd};
use crate::mpd::parser::parse_mpd;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct MpdProvider {
    mpd_url: String,
    download_manager: Arc<dyn DownloadManager>,
    mpd: Arc<RwLock<Option<Mpd>>>,
    refresh_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MpdProvider {
    pub fn new(mpd_url: impl Into<String>, download_manager: Arc<dyn DownloadManager>) -> Self {
        Self {
            mpd_url: mpd_url.into(),
            download_manager,
            mpd: Arc::new(RwLock::new(None)),
            refresh_task: std::sync::Mutex::new(None),
        }
    }

    /// Read-through accessor: returns the latest parsed manifest, if any.
    pub async fn mpd(&self) -> Option<Mpd> {
        self.mpd.read().await.clone()
    }

    pub async fn start(&self, update_interval: std::time::Duration) -> Result<(), ManifestError> {
        let mpd = self.fetch_and_parse().await?;
        let is_dynamic = mpd.manifest_type == ManifestType::Dynamic;
        *self.mpd.write().await = Some(mpd);

        if is_dynamic {
            let mpd_slot = self.mpd.clone();
            let download_manager = self.download_manager.clone();
            let mpd_url = self.mpd_url.clone();
            let handle = tokio::spawn(async move {
                let mut interval = tokio::time::interval(update_interval);
                interval.tick().await; // first tick fires immediately; skip it, we just fetched
                loop {
                    interval.tick().await;
                    match Self::fetch_and_parse_with(&download_manager, &mpd_url).await {
                        Ok(updated) => {
                            *mpd_slot.write().await = Some(updated);
                            info!("MPD refreshed");
                        }
                        Err(e) => warn!("MPD refresh failed: {e}"),
                    }
                }
            });
            *self.refresh_task.lock().unwrap() = Some(handle);
        } else {
            self.download_manager.close().await;
        }
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(task) = self.refresh_task.lock().unwrap().take() {
            task.abort();
        }
    }

    async fn fetch_and_parse(&self) -> Result<Mpd, ManifestError> {
        Self::fetch_and_parse_with(&self.download_manager, &self.mpd_url).await
    }

    async fn fetch_and_parse_with(download_manager: &Arc<dyn DownloadManager>, url: &str) -> Result<Mpd, ManifestError> {
        download_manager.download(url).await;
        let outcome = download_manager
            .wait_complete(url)
            .await
            .map_err(|source| ManifestError::Fetch {
                url: url.to_string(),
                source,
            })?;
        let (data, _size) = outcome.into_option().ok_or(ManifestError::Empty)?;
        let text = std::str::from_utf8(&data).map_err(|e| ManifestError::Parse(e.to_string()))?;
        parse_mpd(text)
    }
}
