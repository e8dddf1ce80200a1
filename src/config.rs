//! Configuration management for lancast
//!
//! Handles config file loading/saving and cast session defaults.
//! Config is stored at ~/.config/lancast/config.toml

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::hardware::HardwareOverrides;

/// Manifest written by the transcoder inside the segment directory
pub const MANIFEST_NAME: &str = "stream.m3u8";

/// Segment filename pattern handed to the transcoder
pub const SEGMENT_PATTERN: &str = "segment%03d.ts";

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cast session defaults
    pub cast: CastConfig,
    /// Overrides for hardware-derived tuning
    pub hardware: HardwareOverrides,
}

impl Config {
    /// Get config file path (~/.config/lancast/config.toml)
    pub fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("lancast").join("config.toml"))
    }

    /// Load config from the default location, or return default if not found
    pub fn load() -> Self {
        Self::path()
            .map(|p| Self::load_from(&p))
            .unwrap_or_default()
    }

    /// Load config from a specific file, falling back to defaults
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(s) => toml::from_str(&s).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring malformed config file");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        let path = Self::path().ok_or_else(|| anyhow::anyhow!("Could not determine config path"))?;
        self.save_to(&path)
    }

    /// Save config to a specific file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let toml = toml::to_string_pretty(self)?;
        std::fs::write(path, toml)?;
        Ok(())
    }
}

/// Settings for one cast session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CastConfig {
    /// Bind address for the file server (wildcard by default)
    pub host: String,
    pub port: u16,
    /// HLS segment length
    pub segment_duration_secs: u32,
    /// Segments kept in the live playlist
    pub retained_segments: u32,
    /// How long to wait for the first manifest
    pub startup_timeout_secs: u64,
    /// Output height; width follows the aspect ratio
    pub target_height: u32,

    pub video_crf: u32,
    pub video_preset: String,
    pub video_profile: String,
    pub video_level: String,
    pub video_maxrate: String,
    /// Overrides the hardware-derived rate-control buffer when set
    pub video_bufsize: Option<String>,
    pub audio_bitrate: String,
    pub audio_channels: u32,

    /// Transcoder program and any leading arguments
    pub transcoder_command: Vec<String>,
    /// File server program and leading arguments; `None` runs `<current exe> serve`
    pub server_command: Option<Vec<String>>,
    /// Session scratch space: segments under `hls/`, process logs beside it
    pub work_dir: PathBuf,
    /// Process-id manifest for crash recovery
    pub pid_file: PathBuf,
    /// Where failure bundles are archived
    pub failure_archive_dir: PathBuf,

    pub poll_interval_ms: u64,
    /// Wait after launching the server before checking it is alive
    pub server_grace_ms: u64,
    /// Grace period between terminate and kill on stop
    pub stop_timeout_ms: u64,
    /// Sweep the process table for orphans of this configuration before starting
    pub sweep_orphans: bool,
}

impl Default for CastConfig {
    fn default() -> Self {
        let tmp = std::env::temp_dir();
        let archive = dirs::data_local_dir()
            .unwrap_or_else(|| tmp.clone())
            .join("lancast")
            .join("cast_failures");

        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            segment_duration_secs: 2,
            retained_segments: 5,
            startup_timeout_secs: 60,
            target_height: 1080,
            video_crf: 21,
            video_preset: "veryfast".to_string(),
            video_profile: "high".to_string(),
            video_level: "4.1".to_string(),
            video_maxrate: "6000k".to_string(),
            video_bufsize: None,
            audio_bitrate: "192k".to_string(),
            audio_channels: 2,
            transcoder_command: vec!["ffmpeg".to_string()],
            server_command: None,
            work_dir: tmp.join("lancast"),
            pid_file: tmp.join("lancast_stream.pids"),
            failure_archive_dir: archive,
            poll_interval_ms: 500,
            server_grace_ms: 1000,
            stop_timeout_ms: 3000,
            sweep_orphans: true,
        }
    }
}

impl CastConfig {
    /// Directory served over HTTP
    pub fn segment_dir(&self) -> PathBuf {
        self.work_dir.join("hls")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.segment_dir().join(MANIFEST_NAME)
    }

    pub fn transcoder_log_path(&self) -> PathBuf {
        self.work_dir.join("transcoder.log")
    }

    pub fn server_log_path(&self) -> PathBuf {
        self.work_dir.join("server.log")
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn server_grace(&self) -> Duration {
        Duration::from_millis(self.server_grace_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Whether the bind host means "all interfaces"
    pub fn is_wildcard_host(&self) -> bool {
        matches!(self.host.trim(), "" | "0.0.0.0" | "::" | "[::]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cast_config_defaults() {
        let config = CastConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.segment_duration_secs, 2);
        assert_eq!(config.retained_segments, 5);
        assert_eq!(config.startup_timeout_secs, 60);
        assert_eq!(config.target_height, 1080);
        assert_eq!(config.transcoder_command, vec!["ffmpeg".to_string()]);
        assert!(config.sweep_orphans);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [cast]
            port = 9090
            target_height = 720

            [hardware]
            force_cpu = true
            "#,
        )
        .unwrap();

        assert_eq!(config.cast.port, 9090);
        assert_eq!(config.cast.target_height, 720);
        assert_eq!(config.cast.retained_segments, 5);
        assert!(config.hardware.force_cpu);
        assert!(config.hardware.batch_size.is_none());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.cast.port = 8181;
        config.hardware.batch_size = Some(16);
        config.save_to(&path).unwrap();

        assert_eq!(Config::load_from(&path), config);
    }

    #[test]
    fn test_malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "this is = = not toml").unwrap();
        assert_eq!(Config::load_from(&path), Config::default());
    }

    #[test]
    fn test_wildcard_hosts() {
        let mut config = CastConfig::default();
        assert!(config.is_wildcard_host());
        config.host = "::".to_string();
        assert!(config.is_wildcard_host());
        config.host = "192.168.1.20".to_string();
        assert!(!config.is_wildcard_host());
    }

    #[test]
    fn test_session_paths() {
        let mut config = CastConfig::default();
        config.work_dir = PathBuf::from("/tmp/cast-test");
        assert_eq!(config.segment_dir(), PathBuf::from("/tmp/cast-test/hls"));
        assert_eq!(
            config.manifest_path(),
            PathBuf::from("/tmp/cast-test/hls/stream.m3u8")
        );
        assert_eq!(
            config.transcoder_log_path(),
            PathBuf::from("/tmp/cast-test/transcoder.log")
        );
    }
}
