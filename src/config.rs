//! Configuration loading, grounded on
//! `original_source/dash_emulator_quic/config/__init__.py::load_config_env`,
//! `.../player_config.py::PlayerConfiguration` and
//! `.../downloader_confrig.py::DownloaderConfiguration`. YAML is parsed with
//! `serde_yaml`; the original's `pkg_resources.resource_stream` lookup of a
//! bundled `resources/application-{name}.yaml` becomes a small compiled-in
//! registry via `include_str!` — Rust has no runtime package-resource
//! lookup, so only the profiles actually shipped in `resources/` can be
//! named by `--env`; anything else falls back to a filesystem path exactly
//! as `load_config_env` does when the bundled lookup raises `FileNotFoundError`.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// `player.downloader`: which transport the download manager uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Downloader {
    Quic,
    Tcp,
}

impl FromStr for Downloader {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "quic" => Ok(Downloader::Quic),
            "tcp" => Ok(Downloader::Tcp),
            other => Err(ConfigError::UnknownDownloader(other.to_string())),
        }
    }
}

/// `player.buffer-settings`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BufferSettings {
    pub buffer_duration: f64,
    pub safe_buffer_level: f64,
    pub panic_buffer_level: f64,
    pub min_rebuffer_duration: f64,
    pub min_start_duration: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    pub buffer_settings: BufferSettings,
    pub downloader: Downloader,
}

#[derive(Debug, Deserialize)]
struct PlayerSectionIn {
    #[serde(rename = "buffer-settings")]
    buffer_settings: BufferSettings,
    downloader: String,
}

#[derive(Debug, Deserialize)]
struct RawConfigIn {
    player: PlayerSectionIn,
}

#[derive(Serialize)]
struct PlayerSectionOut<'a> {
    #[serde(rename = "buffer-settings")]
    buffer_settings: &'a BufferSettings,
    downloader: &'static str,
}

#[derive(Serialize)]
struct RawConfigOut<'a> {
    player: PlayerSectionOut<'a>,
}

const DEFAULT_PROFILE: &str = include_str!("../resources/application.yaml");

/// Profiles compiled into the binary. `load_config_env` in the original
/// tries `resources/application-{name}.yaml` first and only falls back to
/// treating `name` as a path when that lookup fails; the same precedence is
/// preserved here.
fn bundled_profile(name: &str) -> Option<&'static str> {
    match name {
        "quic" => Some(include_str!("../resources/application-quic.yaml")),
        "tcp" => Some(include_str!("../resources/application-tcp.yaml")),
        _ => None,
    }
}

/// `--env NAME_OR_PATH`: `None` loads the default bundled profile; `Some(name)`
/// tries a bundled profile first, then a filesystem path.
pub fn load_config_env(env: Option<&str>) -> Result<PlayerConfig, ConfigError> {
    let content = match env {
        None | Some("") => DEFAULT_PROFILE.to_string(),
        Some(name) => match bundled_profile(name) {
            Some(bundled) => bundled.to_string(),
            None => {
                let path = Path::new(name);
                std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: name.to_string(),
                    source,
                })?
            }
        },
    };
    parse_config(&content)
}

fn parse_config(content: &str) -> Result<PlayerConfig, ConfigError> {
    let raw: RawConfigIn = serde_yaml::from_str(content)?;
    let downloader = raw.player.downloader.parse()?;
    Ok(PlayerConfig {
        buffer_settings: raw.player.buffer_settings,
        downloader,
    })
}

/// Serializes back to the same nested `player.buffer-settings`/`downloader`
/// shape `parse_config` reads: loading, serializing, and reloading a config
/// preserves all recognised fields.
pub fn to_yaml(config: &PlayerConfig) -> Result<String, ConfigError> {
    let downloader = match config.downloader {
        Downloader::Quic => "quic",
        Downloader::Tcp => "tcp",
    };
    let raw = RawConfigOut {
        player: PlayerSectionOut {
            buffer_settings: &config.buffer_settings,
            downloader,
        },
    };
    serde_yaml::to_string(&raw).map_err(ConfigError::Parse)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_parses() {
        let config = load_config_env(None).unwrap();
        assert_eq!(config.downloader, Downloader::Tcp);
        assert!(config.buffer_settings.buffer_duration > 0.0);
    }

    #[test]
    fn bundled_quic_profile_round_trips() {
        let config = load_config_env(Some("quic")).unwrap();
        assert_eq!(config.downloader, Downloader::Quic);

        let yaml = to_yaml(&config).unwrap();
        let reloaded = parse_config(&yaml).unwrap();
        assert_eq!(reloaded.downloader, config.downloader);
        assert_eq!(reloaded.buffer_settings.buffer_duration, config.buffer_settings.buffer_duration);
        assert_eq!(reloaded.buffer_settings.safe_buffer_level, config.buffer_settings.safe_buffer_level);
        assert_eq!(reloaded.buffer_settings.panic_buffer_level, config.buffer_settings.panic_buffer_level);
        assert_eq!(reloaded.buffer_settings.min_rebuffer_duration, config.buffer_settings.min_rebuffer_duration);
        assert_eq!(reloaded.buffer_settings.min_start_duration, config.buffer_settings.min_start_duration);
    }

    #[test]
    fn unknown_downloader_is_a_config_error() {
        let yaml = r#"
player:
  buffer-settings:
    buffer_duration: 10
    safe_buffer_level: 7.5
    panic_buffer_level: 3
    min_rebuffer_duration: 2.5
    min_start_duration: 2.5
  downloader: sctp
"#;
        assert!(matches!(parse_config(yaml), Err(ConfigError::UnknownDownloader(_))));
    }

    #[test]
    fn unknown_env_name_falls_back_to_filesystem_path_and_fails_cleanly() {
        let err = load_config_env(Some("/nonexistent/path/application-ghost.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
