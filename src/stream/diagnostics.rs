//! Failure bundles
//!
//! When a session dies during startup the transcoder and server logs are the
//! only evidence, and they live in the work directory that teardown deletes.
//! A bundle copies them into a timestamped archive directory together with a
//! `metadata.json` describing the session.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::CastConfig;

const STEM_LIMIT: usize = 48;

/// Why a bundle was captured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    TranscoderExited,
    StartupTimeout,
    ServerExited,
    /// The file server could not be launched after the transcoder was running
    ServerStartFailed,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::TranscoderExited => "transcoder_exited",
            FailureReason::StartupTimeout => "startup_timeout",
            FailureReason::ServerExited => "server_exited",
            FailureReason::ServerStartFailed => "server_start_failed",
        };
        write!(f, "{}", s)
    }
}

/// Contents of `metadata.json`
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub reason: FailureReason,
    pub session_id: String,
    pub video_path: PathBuf,
    pub subtitle_path: Option<PathBuf>,
    pub segment_dir: PathBuf,
    pub config: CastConfig,
    pub transcoder_exit_code: Option<i32>,
    pub server_exit_code: Option<i32>,
    pub timestamp: DateTime<Utc>,
    pub detail: Option<String>,
}

/// Log files to copy next to the metadata
#[derive(Debug, Clone, Copy)]
pub struct SessionLogs<'a> {
    pub transcoder: &'a Path,
    pub server: &'a Path,
}

/// Filesystem-safe stem of the video name
pub fn safe_stem(video: &Path) -> String {
    let stem = video
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let safe: String = stem
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(STEM_LIMIT)
        .collect();

    if safe.is_empty() {
        "video".to_string()
    } else {
        safe
    }
}

/// Write a bundle under `archive_dir`. Returns its path, or `None` if any
/// step failed; capture never fails the caller.
pub fn capture_failure(
    archive_dir: &Path,
    report: &FailureReport,
    logs: SessionLogs<'_>,
) -> Option<PathBuf> {
    match write_bundle(archive_dir, report, logs) {
        Ok(dir) => {
            info!(reason = %report.reason, bundle = %dir.display(), "Captured failure bundle");
            Some(dir)
        }
        Err(e) => {
            warn!(reason = %report.reason, error = %e, "Failed to capture failure bundle");
            None
        }
    }
}

fn write_bundle(
    archive_dir: &Path,
    report: &FailureReport,
    logs: SessionLogs<'_>,
) -> io::Result<PathBuf> {
    std::fs::create_dir_all(archive_dir)?;

    let base = format!(
        "{}_{}",
        report.timestamp.format("%Y%m%dT%H%M%SZ"),
        safe_stem(&report.video_path)
    );
    let dir = create_unique_dir(archive_dir, &base)?;

    let metadata = serde_json::to_string_pretty(report)?;
    std::fs::write(dir.join("metadata.json"), metadata)?;

    for (src, name) in [(logs.transcoder, "transcoder.log"), (logs.server, "server.log")] {
        if src.exists() {
            if let Err(e) = std::fs::copy(src, dir.join(name)) {
                warn!(log = %src.display(), error = %e, "Failed to copy log into bundle");
            }
        }
    }

    Ok(dir)
}

/// `create_dir` is atomic, so a concurrent capture cannot claim the same name
fn create_unique_dir(parent: &Path, base: &str) -> io::Result<PathBuf> {
    let mut counter = 1u32;
    loop {
        let name = if counter == 1 {
            base.to_string()
        } else {
            format!("{}_{}", base, counter)
        };
        let candidate = parent.join(name);
        match std::fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => counter += 1,
            Err(e) => return Err(e),
        }
    }
}
