//! Headless playback driver.
//!
//! The decoded-frame buffer clock is an out-of-scope external collaborator
//! (interface only) — the real system's frame decoder drains buffered
//! seconds as it consumes them. This crate has no decoder,
//! but something still has to own the `Ready`/`Buffering` state transitions
//! the BETA governor and analyzer read as `StateSink` input, and drain the
//! buffer the scheduler fills, or the pipeline never produces a second
//! segment once `max_buffer_duration` is reached. `DashPlayer` is the
//! minimal clock that does exactly that: it drains at normal (1x) playback
//! speed once enough has buffered, and re-enters `Buffering` on underrun —
//! the state machine implied by `player_factory.py`'s
//! `DASHPlayer(min_rebuffer_duration=..., min_start_buffer_duration=...)`
//! call sites (the `DASHPlayer` class itself lives in the `dash_emulator`
//! base package, not retrieved into `original_source/`).

use crate::buffer::BufferManager;
use crate::clock::SharedClock;
use crate::error::ManifestError;
use crate::models::{Mpd, PlayerState, StateSink};
use crate::mpd::MpdProvider;
use crate::scheduler::Scheduler;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, Copy)]
pub struct PlayerConfig {
    /// Tick rate of the drain/state loop; also the rate the scheduler polls
    /// its own `buffer_level > max_buffer_duration` gate at.
    pub update_interval: Duration,
    pub min_rebuffer_duration: f64,
    pub min_start_duration: f64,
}

/// Drives buffer drain + `Ready`/`Buffering` transitions, keeps the
/// scheduler's manifest snapshot in sync with the MPD provider's refresh,
/// and owns the top-level cancellation token: cancelling the top-level
/// player cancels all tasks it spawned.
pub struct DashPlayer {
    config: PlayerConfig,
    buffer_manager: Arc<BufferManager>,
    mpd_provider: Arc<MpdProvider>,
    scheduler: Arc<Scheduler>,
    state_sinks: Vec<Arc<dyn StateSink>>,
    clock: SharedClock,
    cancellation_token: CancellationToken,
    has_started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DashPlayer {
    pub fn new(
        config: PlayerConfig,
        buffer_manager: Arc<BufferManager>,
        mpd_provider: Arc<MpdProvider>,
        scheduler: Arc<Scheduler>,
        state_sinks: Vec<Arc<dyn StateSink>>,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            buffer_manager,
            mpd_provider,
            scheduler,
            state_sinks,
            clock,
            cancellation_token: CancellationToken::new(),
            has_started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn emit_buffer_level(&self, level: f64) {
        for sink in &self.state_sinks {
            sink.on_buffer_level_change(level);
        }
    }

    fn emit_state(&self, state: PlayerState) {
        for sink in &self.state_sinks {
            sink.on_state_change(state);
        }
    }

    /// Starts the manifest-sync task, the scheduler task, and runs the
    /// drain/state-transition loop on the caller's task until playback ends
    /// (the scheduler reaches the end of the timeline and the buffer has
    /// fully drained) or `stop()` is called.
    pub async fn start(self: &Arc<Self>) -> Result<(), ManifestError> {
        self.emit_state(PlayerState::Buffering);
        self.emit_buffer_level(self.buffer_manager.buffer_level());

        let scheduler_handle = tokio::spawn(self.scheduler.clone().run());
        let mpd_sync_handle = tokio::spawn(Self::sync_mpd_loop(
            self.mpd_provider.clone(),
            self.scheduler.clone(),
            self.config.update_interval,
            self.cancellation_token.clone(),
        ));
        self.tasks.lock().unwrap().push(scheduler_handle);
        self.tasks.lock().unwrap().push(mpd_sync_handle);

        self.run_drain_loop().await;
        Ok(())
    }

    async fn sync_mpd_loop(
        mpd_provider: Arc<MpdProvider>,
        scheduler: Arc<Scheduler>,
        update_interval: Duration,
        cancellation_token: CancellationToken,
    ) {
        let mut last: Option<Mpd> = None;
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => return,
                _ = tokio::time::sleep(update_interval.max(Duration::from_millis(200))) => {}
            }
            let Some(mpd) = mpd_provider.mpd().await else { continue };
            if last.as_ref().map(|m| m.adaptation_sets.len()) != Some(mpd.adaptation_sets.len()) || last.is_none() {
                scheduler.update_mpd(mpd.clone());
                last = Some(mpd);
            }
        }
    }

    async fn run_drain_loop(self: &Arc<Self>) {
        let mut currently_buffering = true;
        loop {
            if self.cancellation_token.is_cancelled() {
                return;
            }

            let level = self.buffer_manager.buffer_level();
            self.emit_buffer_level(level);

            if currently_buffering {
                let threshold = if self.has_started.load(Ordering::Acquire) {
                    self.config.min_rebuffer_duration
                } else {
                    self.config.min_start_duration
                };
                if level >= threshold {
                    currently_buffering = false;
                    self.has_started.store(true, Ordering::Release);
                    self.emit_state(PlayerState::Ready);
                    info!("playback ready: buffer_level={level:.2}s");
                }
            } else {
                self.buffer_manager.drain(self.config.update_interval.as_secs_f64());
                if self.buffer_manager.buffer_level() <= 0.0 {
                    if self.scheduler.is_end() {
                        self.emit_state(PlayerState::End);
                        info!("playback ended: buffer drained and scheduler reached end of timeline");
                        return;
                    }
                    currently_buffering = true;
                    self.emit_state(PlayerState::Buffering);
                    info!("stall: buffer underrun");
                }
            }

            tokio::select! {
                _ = self.cancellation_token.cancelled() => return,
                _ = tokio::time::sleep(self.config.update_interval) => {}
            }
        }
    }

    /// Cancels all tasks this player spawned. The caller is still
    /// responsible for closing its download manager(s).
    pub fn stop(&self) {
        self.cancellation_token.cancel();
        self.mpd_provider.stop();
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}
