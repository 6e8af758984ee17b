//! CLI entry point, grounded on
//! `original_source/scripts/dash-emulator.py` and, for the `clap`-derive
//! style, `Agent/src/main.rs` / `Client/receiver/src/args.rs`.

use clap::Parser;
use dash_emulator::abr::{AbrSelector, DefaultBandwidthSelector};
use dash_emulator::analyzer::PlaybackAnalyzer;
use dash_emulator::bandwidth::{BandwidthMeter, BandwidthMeterSink, BandwidthSink};
use dash_emulator::beta::vq_threshold::FixedVqThresholdManager;
use dash_emulator::beta::{self, GovernorPolicy};
use dash_emulator::buffer::BufferManager;
use dash_emulator::clock::{SharedClock, SystemClock};
use dash_emulator::config::{self, Downloader, PlayerConfig};
use dash_emulator::download::quic::QuicDownloadManager;
use dash_emulator::download::tcp::TcpDownloadManager;
use dash_emulator::download::{DownloadManager, ProgressSink};
use dash_emulator::error::{CliError, ManifestError};
use dash_emulator::models::StateSink;
use dash_emulator::mpd::MpdProvider;
use dash_emulator::player::{DashPlayer, PlayerConfig as RuntimeConfig};
use dash_emulator::scheduler::{Scheduler, SchedulerConfig, SchedulerObserver};
use regex::Regex;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::FmtSubscriber;

/// Matches `cfg.update_interval` (0.05s) referenced throughout
/// `player_factory.py`: the scheduler's buffer-gate poll rate and the
/// player's drain-tick rate.
const UPDATE_INTERVAL: Duration = Duration::from_millis(50);
/// Fallback poll rate for a dynamic manifest's periodic refresh, used until
/// the first fetch tells us the manifest's own `minimumUpdatePeriod`.
const MPD_REFRESH_FALLBACK: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(author, version, about = "Headless adaptive MPEG-DASH client with the BETA early-abort download governor")]
struct Args {
    /// Enable the BETA early-abort/replace download governor.
    #[arg(long)]
    beta: bool,
    /// Directory to save plots to. Accepted for CLI compatibility; plotting
    /// (matplotlib in the original) is an external collaborator and is not
    /// reimplemented in this crate's dependency stack.
    #[arg(long)]
    plot: Option<String>,
    /// Dump the textual report plus per-segment governor diagnostics as
    /// JSON to `PATH-N.json`.
    #[arg(long = "dump-results")]
    dump_results: Option<String>,
    /// Bundled profile name (`quic`, `tcp`) or a filesystem path to a YAML
    /// configuration file.
    #[arg(long)]
    env: Option<String>,
    /// Adaptation algorithm to use. Reserved for future selector plugins;
    /// only the bandwidth-based default selector is implemented, the ABR
    /// bitrate-selection policy proper being an external collaborator.
    #[arg(long, default_value = "bandwidth-based")]
    abr: String,
    /// Automatically overwrite an existing plot output directory without
    /// prompting.
    #[arg(short = 'y')]
    overwrite: bool,
    /// Number of experiment repetitions.
    #[arg(long, default_value_t = 1)]
    num: u32,
    /// Target MPD URL; must start with `http://` or `https://`.
    target: String,
}

fn validate_target(target: &str) -> Result<(), CliError> {
    let re = Regex::new(r"^https?://").expect("static regex is valid");
    if re.is_match(target) {
        Ok(())
    } else {
        Err(CliError::InvalidTargetUrl(target.to_string()))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let subscriber = FmtSubscriber::builder().with_target(false).compact().finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("failed to install global tracing subscriber");
    }

    let args = Args::parse();

    if let Err(e) = validate_target(&args.target) {
        error!("{e}");
        return ExitCode::from(2);
    }

    if let Some(plot_dir) = &args.plot {
        let existed = std::path::Path::new(plot_dir).exists();
        if let Err(source) = std::fs::create_dir_all(plot_dir) {
            let err = CliError::OutputDir { path: plot_dir.clone(), source };
            error!("{err}");
            return ExitCode::from(2);
        }
        if existed && !args.overwrite {
            warn!("plot output directory {plot_dir} already exists; proceeding non-interactively (pass -y to silence this)");
        }
        warn!("--plot {plot_dir}: plotting is an external collaborator not reimplemented in this crate; no plot files will be written");
    }

    let player_config = match config::load_config_env(args.env.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("configuration error: {e}");
            return ExitCode::from(2);
        }
    };

    for run in 0..args.num.max(1) {
        if args.num > 1 {
            info!("starting run {} of {}", run + 1, args.num);
        }
        if let Err(e) = run_once(&args, &player_config).await {
            error!("playback run failed: {e}");
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}

fn build_download_manager(target: &str, downloader: Downloader, sinks: Vec<Arc<dyn ProgressSink>>) -> Result<Arc<dyn DownloadManager>, CliError> {
    match downloader {
        Downloader::Tcp => Ok(TcpDownloadManager::new(sinks)),
        Downloader::Quic => {
            let origin = origin_of(target)?;
            Ok(QuicDownloadManager::new(origin, sinks))
        }
    }
}

fn origin_of(target: &str) -> Result<String, CliError> {
    let parsed = url::Url::parse(target).map_err(|_| CliError::InvalidTargetUrl(target.to_string()))?;
    let host = parsed.host_str().ok_or_else(|| CliError::InvalidTargetUrl(target.to_string()))?;
    let port = parsed.port_or_known_default().unwrap_or(443);
    Ok(format!("{}://{}:{}", parsed.scheme(), host, port))
}

async fn run_once(args: &Args, player_config: &PlayerConfig) -> Result<(), CliError> {
    let clock: SharedClock = Arc::new(SystemClock);
    let buffer_manager = Arc::new(BufferManager::new());
    let buffer_settings = player_config.buffer_settings;

    // Bootstrap: fetch + parse the manifest over its own download manager
    // first, which closes itself once parsed for a static manifest, matching
    // `BETAMPDProviderImpl`'s construction in `player_factory.py`.
    let bootstrap_manager = build_download_manager(&args.target, player_config.downloader, vec![])?;
    let mpd_provider = Arc::new(MpdProvider::new(args.target.clone(), bootstrap_manager));
    mpd_provider.start(MPD_REFRESH_FALLBACK).await.map_err(CliError::Manifest)?;
    let initial_mpd = mpd_provider.mpd().await.ok_or(CliError::Manifest(ManifestError::Empty))?;

    let analyzer = Arc::new(PlaybackAnalyzer::new(mpd_provider.clone(), clock.clone()));
    let bandwidth_meter = Arc::new(BandwidthMeter::new(0.25, Duration::from_millis(500), 1_000_000.0, clock.clone()));

    let mut progress_sinks: Vec<Arc<dyn ProgressSink>> = vec![analyzer.clone()];
    let mut bandwidth_listeners: Vec<Arc<dyn BandwidthSink>> = vec![analyzer.clone()];
    let mut state_sinks: Vec<Arc<dyn StateSink>> = vec![analyzer.clone()];
    let mut scheduler_observers: Vec<Arc<dyn SchedulerObserver>> = vec![analyzer.clone()];

    // The BETA governor is only constructed when `--beta` is passed,
    // matching `player_factory.py`'s `if not beta: ... else: ...` split —
    // the non-beta branch never builds a `BETAManagerImpl` at all. The
    // governor needs a handle to the final (non-bootstrap) download manager,
    // which in turn needs the governor in its own sink list, so the handle
    // is filled in once the manager is built below.
    let download_manager_slot: Arc<std::sync::OnceLock<Arc<dyn DownloadManager>>> = Arc::new(std::sync::OnceLock::new());

    if args.beta {
        let vq_threshold_manager = Arc::new(FixedVqThresholdManager::default());
        let deferred_manager = DeferredDownloadManager::new(download_manager_slot.clone());
        let (governor, _task) = beta::spawn(
            Arc::new(deferred_manager),
            vq_threshold_manager,
            buffer_settings.panic_buffer_level,
            buffer_settings.safe_buffer_level,
            GovernorPolicy::default(),
            clock.clone(),
        );
        progress_sinks.push(governor.clone());
        bandwidth_listeners.push(governor.clone());
        state_sinks.push(governor.clone());
        scheduler_observers.push(governor);
    }

    let bandwidth_sink = Arc::new(BandwidthMeterSink::new(bandwidth_meter.clone(), bandwidth_listeners));
    progress_sinks.push(bandwidth_sink);

    let download_manager = build_download_manager(&args.target, player_config.downloader, progress_sinks)?;
    let _ = download_manager_slot.set(download_manager.clone());

    let abr_selector = Arc::new(AbrSelector::new(Box::new(DefaultBandwidthSelector::default())));
    let scheduler_config = SchedulerConfig {
        max_buffer_duration: buffer_settings.buffer_duration,
        update_interval: UPDATE_INTERVAL,
        slope_smoothing: None,
    };
    let scheduler = Scheduler::new(
        download_manager.clone(),
        bandwidth_meter,
        buffer_manager.clone(),
        abr_selector,
        scheduler_observers,
        scheduler_config,
        initial_mpd,
    );

    let runtime_config = RuntimeConfig {
        update_interval: UPDATE_INTERVAL,
        min_rebuffer_duration: buffer_settings.min_rebuffer_duration,
        min_start_duration: buffer_settings.min_start_duration,
    };
    let player = Arc::new(DashPlayer::new(runtime_config, buffer_manager, mpd_provider, scheduler, state_sinks, clock));
    player.start().await.map_err(CliError::Manifest)?;
    player.stop();

    download_manager.close().await;

    analyzer.save(std::io::stdout(), args.dump_results.as_deref()).await.map_err(CliError::Report)?;

    Ok(())
}

/// A `DownloadManager` that forwards to whichever concrete manager is later
/// installed into its shared slot. Needed because the BETA governor is
/// constructed before the final segment download manager (the governor must
/// hold a handle to it), and the download manager's progress sinks include
/// the governor itself — breaking the cycle with a fill-once indirection
/// rather than restructuring `beta::spawn`'s signature around a two-phase
/// handshake.
struct DeferredDownloadManager {
    slot: Arc<std::sync::OnceLock<Arc<dyn DownloadManager>>>,
}

impl DeferredDownloadManager {
    fn new(slot: Arc<std::sync::OnceLock<Arc<dyn DownloadManager>>>) -> Self {
        Self { slot }
    }

    fn inner(&self) -> &Arc<dyn DownloadManager> {
        self.slot.get().expect("download manager installed before the governor issues its first stop/drop call")
    }
}

#[async_trait::async_trait]
impl DownloadManager for DeferredDownloadManager {
    async fn download(&self, url: &str) {
        self.inner().download(url).await
    }

    async fn wait_complete(&self, url: &str) -> Result<dash_emulator::models::DownloadOutcome, dash_emulator::error::TransportError> {
        self.inner().wait_complete(url).await
    }

    async fn stop(&self, url: &str) {
        self.inner().stop(url).await
    }

    async fn drop_url(&self, url: &str) {
        self.inner().drop_url(url).await
    }

    fn cancel_read(&self, url: &str) {
        self.inner().cancel_read(url)
    }

    async fn close(&self) {
        self.inner().close().await
    }
}
