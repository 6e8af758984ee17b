//! Typed errors for the fatal-before-playback paths (config, manifest, transport).
//! Per-segment download failures are not represented here: the scheduler treats
//! a dropped segment as a `None` result, not an error (spec error taxonomy).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("unknown downloader protocol: {0}")]
    UnknownDownloader(String),
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to fetch manifest {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: TransportError,
    },
    #[error("failed to parse manifest XML: {0}")]
    Parse(String),
    #[error("manifest has no adaptation sets")]
    Empty,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("DNS/connect failure for {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("request to {url} failed: {reason}")]
    Request { url: String, reason: String },
    #[error("stream for {url} was reset before completion")]
    Reset { url: String },
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("target MPD URL must start with http:// or https://: {0}")]
    InvalidTargetUrl(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("failed to create output directory {path}: {source}")]
    OutputDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write playback report: {0}")]
    Report(#[source] std::io::Error),
}
