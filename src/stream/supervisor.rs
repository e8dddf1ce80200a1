//! Cast session supervisor
//!
//! Owns one transcoder + file server pair at a time. `start()` only returns a
//! URL once the transcoder has written its first manifest and the server has
//! survived its grace period; any failure on the way captures a failure bundle
//! and tears everything down again.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{CastConfig, MANIFEST_NAME};
use crate::hardware::HardwareProfiler;

use super::diagnostics::{capture_failure, FailureReason, FailureReport, SessionLogs};
use super::process;
use super::transcode::build_transcoder_args;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors from starting a cast session
#[derive(Debug, Error)]
pub enum CastError {
    #[error("A cast session is already active")]
    AlreadyActive,
    #[error("Video file not found: {}", .0.display())]
    VideoNotFound(PathBuf),
    #[error("Subtitle file not found: {}", .0.display())]
    SubtitleNotFound(PathBuf),
    #[error("Transcoder '{0}' not found. Install ffmpeg or set cast.transcoder_command")]
    TranscoderNotFound(String),
    #[error("File server '{0}' not found")]
    ServerNotFound(String),
    #[error("Failed to start {process}: {source}")]
    Spawn {
        process: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("Failed to prepare session directory {}: {source}", .path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Transcoder exited during startup (exit code {code:?})")]
    TranscoderExited {
        code: Option<i32>,
        bundle: Option<PathBuf>,
    },
    #[error("Transcoder produced no playlist within {secs}s")]
    StartupTimeout { secs: u64, bundle: Option<PathBuf> },
    #[error("File server exited during startup (exit code {code:?})")]
    ServerExited {
        code: Option<i32>,
        bundle: Option<PathBuf>,
    },
    /// The transcoder was running but the file server could not be launched
    #[error("{source}")]
    ServerStartFailed {
        #[source]
        source: Box<CastError>,
        bundle: Option<PathBuf>,
    },
}

impl CastError {
    /// Failure bundle captured for this error, if any
    pub fn bundle(&self) -> Option<&Path> {
        match self {
            CastError::TranscoderExited { bundle, .. }
            | CastError::StartupTimeout { bundle, .. }
            | CastError::ServerExited { bundle, .. }
            | CastError::ServerStartFailed { bundle, .. } => bundle.as_deref(),
            _ => None,
        }
    }
}

/// Lifecycle of the supervised pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Idle,
    Cleaning,
    LaunchingTranscoder,
    AwaitingManifest,
    LaunchingServer,
    Live,
    Stopping,
    Failed,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SupervisorState::Idle => "idle",
            SupervisorState::Cleaning => "cleaning",
            SupervisorState::LaunchingTranscoder => "launching_transcoder",
            SupervisorState::AwaitingManifest => "awaiting_manifest",
            SupervisorState::LaunchingServer => "launching_server",
            SupervisorState::Live => "live",
            SupervisorState::Stopping => "stopping",
            SupervisorState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// The one active session
#[derive(Debug)]
pub struct CastSession {
    pub id: Uuid,
    pub video: PathBuf,
    pub subtitle: Option<PathBuf>,
    pub config: CastConfig,
    pub segment_dir: PathBuf,
    pub url: String,
    pub started_at: DateTime<Utc>,
    transcoder: Child,
    server: Child,
}

impl CastSession {
    pub fn transcoder_pid(&self) -> Option<u32> {
        self.transcoder.id()
    }

    pub fn server_pid(&self) -> Option<u32> {
        self.server.id()
    }
}

/// Children launched so far in a `start()` that has not finished yet
#[derive(Default)]
struct Launch {
    transcoder: Option<Child>,
    server: Option<Child>,
}

/// Inputs shared by every step of one `start()`
struct Attempt<'a> {
    id: Uuid,
    video: &'a Path,
    subtitle: Option<&'a Path>,
    config: &'a CastConfig,
}

/// Tracks the state of an in-flight `start()`.
///
/// If the `start()` future is dropped before it completes, the children die
/// through `kill_on_drop` and this puts the supervisor back to `Idle` and
/// removes the half-built work directory.
struct StartGuard<'a> {
    state: &'a mut SupervisorState,
    work_dir: PathBuf,
    armed: bool,
}

impl StartGuard<'_> {
    fn enter(&mut self, state: SupervisorState) {
        debug!(from = %self.state, to = %state, "Supervisor state");
        *self.state = state;
    }

    /// The attempt ran to completion; the caller sets the final state
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(state = %self.state, "Cast start abandoned, cleaning up");
        *self.state = SupervisorState::Idle;
        remove_work_dir(&self.work_dir);
    }
}

/// Supervises the transcoder and file server for a single cast session
pub struct StreamSupervisor {
    hardware: Arc<HardwareProfiler>,
    state: SupervisorState,
    session: Option<CastSession>,
}

impl StreamSupervisor {
    pub fn new(hardware: Arc<HardwareProfiler>) -> Self {
        Self {
            hardware,
            state: SupervisorState::Idle,
            session: None,
        }
    }

    pub fn hardware(&self) -> &Arc<HardwareProfiler> {
        &self.hardware
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn session(&self) -> Option<&CastSession> {
        self.session.as_ref()
    }

    /// Start casting `video`, returning the stream URL once it is playable
    pub async fn start(
        &mut self,
        video: &Path,
        subtitle: Option<&Path>,
        config: CastConfig,
    ) -> Result<String, CastError> {
        if self.state != SupervisorState::Idle || self.session.is_some() {
            return Err(CastError::AlreadyActive);
        }

        let id = Uuid::new_v4();
        info!(session = %id, video = %video.display(), "Starting cast session");

        // Declared before `launch` so abandoned children are killed before the cleanup runs
        let mut guard = StartGuard {
            state: &mut self.state,
            work_dir: config.work_dir.clone(),
            armed: true,
        };
        let mut launch = Launch::default();
        let result = launch_session(
            &self.hardware,
            &mut guard,
            id,
            video,
            subtitle,
            &config,
            &mut launch,
        )
        .await;
        guard.disarm();

        match result {
            Ok(session) => {
                let url = session.url.clone();
                self.session = Some(session);
                self.state = SupervisorState::Live;
                info!(session = %id, %url, "Cast session live");
                Ok(url)
            }
            Err(e) => {
                self.state = SupervisorState::Failed;
                warn!(session = %id, error = %e, "Cast session failed to start");
                self.state = SupervisorState::Idle;
                Err(e)
            }
        }
    }

    /// Whether the session is live with both processes still running
    pub fn is_casting(&mut self) -> bool {
        if self.state != SupervisorState::Live {
            return false;
        }
        let Some(session) = self.session.as_mut() else {
            return false;
        };

        let transcoder_alive = matches!(session.transcoder.try_wait(), Ok(None));
        let server_alive = matches!(session.server.try_wait(), Ok(None));
        if !(transcoder_alive && server_alive) {
            debug!(transcoder_alive, server_alive, "Cast pipeline no longer running");
        }
        transcoder_alive && server_alive
    }

    /// Stream URL while casting
    pub fn current_url(&mut self) -> Option<&str> {
        if !self.is_casting() {
            return None;
        }
        self.session.as_ref().map(|s| s.url.as_str())
    }

    /// Stop the session and remove everything it created. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        let Some(mut session) = self.session.take() else {
            self.state = SupervisorState::Idle;
            return;
        };

        self.state = SupervisorState::Stopping;
        info!(session = %session.id, "Stopping cast session");

        let timeout = session.config.stop_timeout();
        process::shutdown_child(&mut session.transcoder, "transcoder", timeout).await;
        process::shutdown_child(&mut session.server, "file server", timeout).await;

        remove_work_dir(&session.config.work_dir);
        process::remove_pid_file(&session.config.pid_file);

        self.state = SupervisorState::Idle;
        info!(session = %session.id, "Cast session stopped");
    }
}

/// Every startup stage after the `Idle` check. On error nothing is left running.
async fn launch_session(
    hardware: &HardwareProfiler,
    stage: &mut StartGuard<'_>,
    id: Uuid,
    video: &Path,
    subtitle: Option<&Path>,
    config: &CastConfig,
    launch: &mut Launch,
) -> Result<CastSession, CastError> {
    stage.enter(SupervisorState::Cleaning);
    preflight_cleanup(config).await;

    if !video.is_file() {
        return Err(CastError::VideoNotFound(video.to_path_buf()));
    }
    let subtitle = match subtitle {
        Some(path) if path.is_file() => Some(absolute(path)),
        Some(path) => return Err(CastError::SubtitleNotFound(path.to_path_buf())),
        None => None,
    };

    prepare_workspace(config)?;

    let attempt = Attempt {
        id,
        video,
        subtitle: subtitle.as_deref(),
        config,
    };

    // Transcoder
    stage.enter(SupervisorState::LaunchingTranscoder);
    let encoding = hardware.encoding_profile();
    debug!(encoder = %encoding.encoder, hwaccel = ?encoding.hwaccel, "Encoding profile");

    let (program, leading) = match config.transcoder_command.split_first() {
        Some((program, rest)) if !program.is_empty() => (program.clone(), rest.to_vec()),
        _ => return Err(CastError::TranscoderNotFound(String::new())),
    };
    let mut args = leading;
    args.extend(build_transcoder_args(&encoding, config, video, attempt.subtitle));

    let log = open_log(&config.transcoder_log_path())?;
    let transcoder = spawn_logged(&program, &args, log).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            CastError::TranscoderNotFound(program.clone())
        } else {
            CastError::Spawn {
                process: "transcoder",
                source: e,
            }
        }
    });
    let transcoder = match transcoder {
        Ok(child) => child,
        Err(e) => {
            teardown(launch, config).await;
            return Err(e);
        }
    };
    info!(pid = ?transcoder.id(), %program, "Transcoder launched");
    launch.transcoder = Some(transcoder);

    // Manifest
    stage.enter(SupervisorState::AwaitingManifest);
    await_manifest(&attempt, launch).await?;

    // File server
    stage.enter(SupervisorState::LaunchingServer);
    let server = server_invocation(config).and_then(|(program, args)| {
        let log = open_log(&config.server_log_path())?;
        let child = spawn_logged(&program, &args, log).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                CastError::ServerNotFound(program.clone())
            } else {
                CastError::Spawn {
                    process: "file server",
                    source: e,
                }
            }
        })?;
        info!(pid = ?child.id(), %program, port = config.port, "File server launched");
        Ok(child)
    });
    match server {
        Ok(child) => launch.server = Some(child),
        Err(e) => {
            warn!(error = %e, "File server failed to launch");
            let detail = Some(e.to_string());
            let bundle = fail(&attempt, launch, FailureReason::ServerStartFailed, detail).await;
            return Err(CastError::ServerStartFailed {
                source: Box::new(e),
                bundle,
            });
        }
    }

    tokio::time::sleep(config.server_grace()).await;
    let server_exit = launch
        .server
        .as_mut()
        .and_then(|child| child.try_wait().ok().flatten());
    if let Some(status) = server_exit {
        let code = status.code();
        warn!(?code, "File server exited during startup");
        let bundle = fail(&attempt, launch, FailureReason::ServerExited, None).await;
        return Err(CastError::ServerExited { code, bundle });
    }

    probe_server(config.port).await;

    let (Some(transcoder), Some(server)) = (launch.transcoder.take(), launch.server.take())
    else {
        return Err(CastError::Spawn {
            process: "cast session",
            source: io::Error::new(io::ErrorKind::Other, "child handle missing"),
        });
    };

    let pids: Vec<u32> = [transcoder.id(), server.id()].into_iter().flatten().collect();
    if let Err(e) = process::write_pid_file(&config.pid_file, &pids) {
        warn!(path = %config.pid_file.display(), error = %e, "Failed to write pid file");
    }

    Ok(CastSession {
        id,
        video: video.to_path_buf(),
        subtitle,
        config: config.clone(),
        segment_dir: config.segment_dir(),
        url: stream_url(&public_host(config), config.port),
        started_at: Utc::now(),
        transcoder,
        server,
    })
}

// =============================================================================
// Startup helpers
// =============================================================================

/// Kill leftovers from an earlier run: recorded pids first, then a pattern sweep
pub async fn preflight_cleanup(config: &CastConfig) {
    let killed = process::reap_pid_file(&config.pid_file).await;
    if killed > 0 {
        info!(killed, "Terminated processes from a previous session");
    }
    if config.sweep_orphans {
        process::sweep_patterns(&orphan_patterns(config)).await;
    }
}

/// Command-line patterns unique to this configuration's pipeline
pub fn orphan_patterns(config: &CastConfig) -> Vec<String> {
    let manifest = config.manifest_path();
    let segment_dir = config.segment_dir();
    vec![
        regex::escape(&manifest.to_string_lossy()),
        format!(
            "serve --dir {} --port {}",
            regex::escape(&segment_dir.to_string_lossy()),
            config.port
        ),
    ]
}

fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path)
        .or_else(|_| std::env::current_dir().map(|cwd| cwd.join(path)))
        .unwrap_or_else(|_| path.to_path_buf())
}

fn prepare_workspace(config: &CastConfig) -> Result<(), CastError> {
    let work_dir = &config.work_dir;
    if work_dir.exists() {
        std::fs::remove_dir_all(work_dir).map_err(workspace_err(work_dir))?;
    }
    let segment_dir = config.segment_dir();
    std::fs::create_dir_all(&segment_dir).map_err(workspace_err(&segment_dir))?;

    for log in [config.transcoder_log_path(), config.server_log_path()] {
        File::create(&log).map_err(workspace_err(&log))?;
    }
    Ok(())
}

fn workspace_err(path: &Path) -> impl FnOnce(io::Error) -> CastError {
    let path = path.to_path_buf();
    move |source| CastError::Workspace { path, source }
}

fn open_log(path: &Path) -> Result<File, CastError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(workspace_err(path))
}

fn spawn_logged(program: &str, args: &[String], log: File) -> io::Result<Child> {
    let stderr = log.try_clone()?;
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true)
        .spawn()
}

/// Program and arguments for the file server
fn server_invocation(config: &CastConfig) -> Result<(String, Vec<String>), CastError> {
    let mut command = match &config.server_command {
        Some(cmd) if !cmd.is_empty() => cmd.clone(),
        Some(_) => return Err(CastError::ServerNotFound(String::new())),
        None => {
            let exe = std::env::current_exe()
                .map_err(|_| CastError::ServerNotFound("current executable".to_string()))?;
            vec![exe.to_string_lossy().into_owned()]
        }
    }
    .into_iter();

    let program = command
        .next()
        .ok_or_else(|| CastError::ServerNotFound(String::new()))?;
    let mut args: Vec<String> = command.collect();
    args.extend([
        "serve".to_string(),
        "--dir".to_string(),
        config.segment_dir().to_string_lossy().into_owned(),
        "--port".to_string(),
        config.port.to_string(),
        "--host".to_string(),
        config.host.clone(),
    ]);
    Ok((program, args))
}

/// Poll for the first manifest while watching the transcoder
async fn await_manifest(
    attempt: &Attempt<'_>,
    launch: &mut Launch,
) -> Result<(), CastError> {
    let config = attempt.config;
    let manifest = config.manifest_path();
    let timeout = config.startup_timeout();
    let started = tokio::time::Instant::now();

    loop {
        if manifest.exists() {
            debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Manifest ready");
            return Ok(());
        }

        let exited = launch
            .transcoder
            .as_mut()
            .and_then(|child| child.try_wait().ok().flatten());
        if let Some(status) = exited {
            let code = status.code();
            warn!(?code, "Transcoder exited before writing a manifest");
            let bundle = fail(attempt, launch, FailureReason::TranscoderExited, None).await;
            return Err(CastError::TranscoderExited { code, bundle });
        }

        if started.elapsed() >= timeout {
            warn!(secs = config.startup_timeout_secs, "Timed out waiting for manifest");
            let detail = format!("{} not created", MANIFEST_NAME);
            let bundle =
                fail(attempt, launch, FailureReason::StartupTimeout, Some(detail)).await;
            return Err(CastError::StartupTimeout {
                secs: config.startup_timeout_secs,
                bundle,
            });
        }

        tokio::time::sleep(config.poll_interval()).await;
    }
}

/// HEAD the playlist over loopback. Only logs.
async fn probe_server(port: u16) {
    let url = format!("http://127.0.0.1:{}/{}", port, MANIFEST_NAME);
    let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            debug!(error = %e, "Skipping server probe");
            return;
        }
    };

    match client.head(&url).send().await {
        Ok(resp) if resp.status().is_success() => debug!(%url, "File server answering"),
        Ok(resp) => warn!(%url, status = %resp.status(), "File server probe returned an error"),
        Err(e) => warn!(%url, error = %e, "File server probe failed"),
    }
}

// =============================================================================
// Failure and teardown
// =============================================================================

/// Stop whatever was launched, capture a bundle, then clear the workspace
async fn fail(
    attempt: &Attempt<'_>,
    launch: &mut Launch,
    reason: FailureReason,
    detail: Option<String>,
) -> Option<PathBuf> {
    let config = attempt.config;
    let timeout = config.stop_timeout();

    let transcoder_exit_code = match launch.transcoder.as_mut() {
        Some(child) => process::shutdown_child(child, "transcoder", timeout).await,
        None => None,
    };
    let server_exit_code = match launch.server.as_mut() {
        Some(child) => process::shutdown_child(child, "file server", timeout).await,
        None => None,
    };

    let report = FailureReport {
        reason,
        session_id: attempt.id.to_string(),
        video_path: attempt.video.to_path_buf(),
        subtitle_path: attempt.subtitle.map(Path::to_path_buf),
        segment_dir: config.segment_dir(),
        config: config.clone(),
        transcoder_exit_code,
        server_exit_code,
        timestamp: Utc::now(),
        detail,
    };
    let transcoder_log = config.transcoder_log_path();
    let server_log = config.server_log_path();
    let bundle = capture_failure(
        &config.failure_archive_dir,
        &report,
        SessionLogs {
            transcoder: &transcoder_log,
            server: &server_log,
        },
    );

    teardown(launch, config).await;
    bundle
}

async fn teardown(launch: &mut Launch, config: &CastConfig) {
    let timeout = config.stop_timeout();
    if let Some(mut child) = launch.transcoder.take() {
        process::shutdown_child(&mut child, "transcoder", timeout).await;
    }
    if let Some(mut child) = launch.server.take() {
        process::shutdown_child(&mut child, "file server", timeout).await;
    }
    remove_work_dir(&config.work_dir);
    process::remove_pid_file(&config.pid_file);
}

fn remove_work_dir(dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), error = %e, "Failed to remove session directory");
        }
    }
}

// =============================================================================
// URL
// =============================================================================

/// Host other devices should use to reach the server
pub fn public_host(config: &CastConfig) -> String {
    if !config.is_wildcard_host() {
        return config.host.trim().to_string();
    }
    match local_ip_address::local_ip() {
        Ok(ip) if !ip.is_loopback() && !ip.is_unspecified() => ip.to_string(),
        Ok(ip) => {
            debug!(%ip, "Only a loopback address resolved, using localhost");
            "localhost".to_string()
        }
        Err(e) => {
            debug!(error = %e, "Could not resolve a LAN address, using localhost");
            "localhost".to_string()
        }
    }
}

/// `http://<host>:<port>/stream.m3u8`, bracketing IPv6 literals
pub fn stream_url(host: &str, port: u16) -> String {
    let host = match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => format!("[{}]", v6),
        _ => host.to_string(),
    };
    format!("http://{}:{}/{}", host, port, MANIFEST_NAME)
}
