//! Stream Supervisor Tests
//!
//! Drives the real supervisor with `sh -c` stand-ins for the transcoder and
//! file server. The fake transcoder touches its last argument (the playlist
//! path) and then sleeps, which is all the supervisor can observe anyway.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use lancast::config::CastConfig;
use lancast::hardware::{HardwareProfile, HardwareProfiler};
use lancast::stream::process::{is_pid_running, read_pid_file};
use lancast::stream::{CastError, StreamSupervisor, SupervisorState};
use tempfile::TempDir;

// =============================================================================
// Fixtures
// =============================================================================

fn sh(script: &str, name: &str) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        script.to_string(),
        name.to_string(),
    ]
}

/// Creates the playlist named by its last argument, then idles
fn fake_transcoder() -> Vec<String> {
    sh(
        r#"for last in "$@"; do :; done; touch "$last"; exec sleep 30"#,
        "fake-ffmpeg",
    )
}

fn fake_server() -> Vec<String> {
    sh("exec sleep 30", "fake-server")
}

struct Fixture {
    dir: TempDir,
    video: PathBuf,
    config: CastConfig,
}

impl Fixture {
    fn new(port: u16) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("movie.mp4");
        std::fs::write(&video, b"not really a video").unwrap();

        let config = CastConfig {
            host: "127.0.0.1".to_string(),
            port,
            startup_timeout_secs: 5,
            transcoder_command: fake_transcoder(),
            server_command: Some(fake_server()),
            work_dir: dir.path().join("work"),
            pid_file: dir.path().join("stream.pids"),
            failure_archive_dir: dir.path().join("failures"),
            poll_interval_ms: 50,
            server_grace_ms: 200,
            stop_timeout_ms: 1000,
            ..CastConfig::default()
        };

        Self { dir, video, config }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn bundles(&self) -> Vec<PathBuf> {
        match std::fs::read_dir(&self.config.failure_archive_dir) {
            Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

fn supervisor() -> StreamSupervisor {
    let profiler = HardwareProfiler::from_profile(HardwareProfile::fallback());
    StreamSupervisor::new(Arc::new(profiler))
}

fn read_metadata(bundle: &Path) -> serde_json::Value {
    let raw = std::fs::read_to_string(bundle.join("metadata.json")).unwrap();
    serde_json::from_str(&raw).unwrap()
}

// =============================================================================
// Happy path
// =============================================================================

#[tokio::test]
async fn test_start_then_stop_leaves_nothing_behind() {
    let fx = Fixture::new(18431);
    let mut sup = supervisor();
    assert_eq!(sup.state(), SupervisorState::Idle);

    let url = sup.start(&fx.video, None, fx.config.clone()).await.unwrap();
    assert_eq!(url, "http://127.0.0.1:18431/stream.m3u8");
    assert_eq!(sup.state(), SupervisorState::Live);
    assert!(sup.is_casting());
    assert_eq!(sup.current_url(), Some(url.as_str()));

    // Pid manifest lists both children
    let session = sup.session().unwrap();
    let expected: Vec<u32> = [session.transcoder_pid(), session.server_pid()]
        .into_iter()
        .flatten()
        .collect();
    assert_eq!(expected.len(), 2);
    assert_eq!(read_pid_file(&fx.config.pid_file), expected);
    assert!(fx.config.manifest_path().exists());
    assert!(fx.config.transcoder_log_path().exists());
    assert!(fx.config.server_log_path().exists());

    sup.stop().await;
    assert_eq!(sup.state(), SupervisorState::Idle);
    assert!(!sup.is_casting());
    assert!(sup.current_url().is_none());
    assert!(sup.session().is_none());
    assert!(!fx.config.work_dir.exists());
    assert!(!fx.config.pid_file.exists());
    for pid in expected {
        assert!(!is_pid_running(pid), "pid {} survived stop", pid);
    }

    // Idempotent
    sup.stop().await;
    assert_eq!(sup.state(), SupervisorState::Idle);
    assert!(fx.bundles().is_empty());
}

#[tokio::test]
async fn test_second_start_is_rejected_without_disturbing_session() {
    let fx = Fixture::new(18432);
    let mut sup = supervisor();
    let url = sup.start(&fx.video, None, fx.config.clone()).await.unwrap();

    let err = sup
        .start(&fx.video, None, fx.config.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, CastError::AlreadyActive));
    assert!(sup.is_casting());
    assert_eq!(sup.current_url(), Some(url.as_str()));

    sup.stop().await;
}

#[tokio::test]
async fn test_stop_when_idle_is_noop() {
    let mut sup = supervisor();
    sup.stop().await;
    assert_eq!(sup.state(), SupervisorState::Idle);
    assert!(!sup.is_casting());
}

#[tokio::test]
async fn test_subtitle_is_recorded_as_absolute_path() {
    let fx = Fixture::new(18433);
    let subtitle = fx.path("movie.en.srt");
    std::fs::write(&subtitle, "1\n00:00:01,000 --> 00:00:02,000\nhi\n").unwrap();

    let mut sup = supervisor();
    sup.start(&fx.video, Some(&subtitle), fx.config.clone())
        .await
        .unwrap();
    let recorded = sup.session().and_then(|s| s.subtitle.clone()).unwrap();
    assert!(recorded.is_absolute());
    assert_eq!(recorded.file_name(), subtitle.file_name());

    sup.stop().await;
}

// =============================================================================
// Validation
// =============================================================================

#[tokio::test]
async fn test_missing_video_launches_nothing() {
    let fx = Fixture::new(18434);
    let mut sup = supervisor();

    let err = sup
        .start(&fx.path("nope.mkv"), None, fx.config.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, CastError::VideoNotFound(_)));
    assert_eq!(sup.state(), SupervisorState::Idle);
    assert!(!fx.config.pid_file.exists());
    assert!(!fx.config.work_dir.exists());
    assert!(fx.bundles().is_empty());
}

#[tokio::test]
async fn test_missing_subtitle_launches_nothing() {
    let fx = Fixture::new(18435);
    let mut sup = supervisor();

    let err = sup
        .start(&fx.video, Some(&fx.path("missing.srt")), fx.config.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, CastError::SubtitleNotFound(_)));
    assert!(!fx.config.pid_file.exists());
    assert!(!fx.config.work_dir.exists());
}

#[tokio::test]
async fn test_missing_transcoder_binary() {
    let fx = Fixture::new(18436);
    let mut config = fx.config.clone();
    config.transcoder_command = vec![fx.path("no-such-ffmpeg").to_string_lossy().into_owned()];

    let mut sup = supervisor();
    let err = sup.start(&fx.video, None, config).await.unwrap_err();
    assert!(matches!(err, CastError::TranscoderNotFound(_)));
    assert_eq!(sup.state(), SupervisorState::Idle);
    assert!(!fx.config.work_dir.exists());
    assert!(fx.bundles().is_empty());
}

// =============================================================================
// Startup failures
// =============================================================================

#[tokio::test]
async fn test_transcoder_exit_captures_bundle() {
    let fx = Fixture::new(18437);
    let mut config = fx.config.clone();
    config.transcoder_command = sh("echo 'Unknown encoder' >&2; exit 3", "fake-ffmpeg");

    let mut sup = supervisor();
    let err = sup.start(&fx.video, None, config).await.unwrap_err();
    let CastError::TranscoderExited { code, bundle } = &err else {
        panic!("unexpected error: {:?}", err);
    };
    assert_eq!(*code, Some(3));

    let bundle = bundle.clone().unwrap();
    assert!(bundle.starts_with(&fx.config.failure_archive_dir));
    assert!(bundle
        .file_name()
        .unwrap()
        .to_string_lossy()
        .ends_with("_movie"));
    let log = std::fs::read_to_string(bundle.join("transcoder.log")).unwrap();
    assert!(log.contains("Unknown encoder"));
    assert!(bundle.join("server.log").exists());

    let meta = read_metadata(&bundle);
    assert_eq!(meta["reason"], "transcoder_exited");
    assert_eq!(meta["transcoder_exit_code"], 3);
    assert!(meta["server_exit_code"].is_null());

    assert_eq!(sup.state(), SupervisorState::Idle);
    assert!(!fx.config.work_dir.exists());
    assert!(!fx.config.pid_file.exists());
}

#[tokio::test]
async fn test_startup_timeout_captures_bundle_and_kills_transcoder() {
    let fx = Fixture::new(18438);
    let pid_out = fx.path("transcoder.pid");
    let mut config = fx.config.clone();
    config.startup_timeout_secs = 1;
    // $0 is the pid output path; never writes a playlist
    config.transcoder_command = sh(
        r#"echo $$ > "$0"; exec sleep 30"#,
        &pid_out.to_string_lossy(),
    );

    let mut sup = supervisor();
    let err = sup.start(&fx.video, None, config).await.unwrap_err();
    let CastError::StartupTimeout { secs, bundle } = &err else {
        panic!("unexpected error: {:?}", err);
    };
    assert_eq!(*secs, 1);

    let bundle = bundle.clone().unwrap();
    assert!(bundle.join("transcoder.log").exists());
    assert!(bundle.join("server.log").exists());
    let meta = read_metadata(&bundle);
    assert_eq!(meta["reason"], "startup_timeout");
    assert_eq!(meta["config"]["port"], 18438);

    let pid: u32 = std::fs::read_to_string(&pid_out)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(!is_pid_running(pid), "transcoder {} left running", pid);
    assert!(!fx.config.work_dir.exists());
    assert_eq!(sup.state(), SupervisorState::Idle);
}

#[tokio::test]
async fn test_server_exit_captures_bundle() {
    let fx = Fixture::new(18439);
    let mut config = fx.config.clone();
    config.server_command = Some(sh("echo 'address in use' >&2; exit 7", "fake-server"));

    let mut sup = supervisor();
    let err = sup.start(&fx.video, None, config).await.unwrap_err();
    let CastError::ServerExited { code, bundle } = &err else {
        panic!("unexpected error: {:?}", err);
    };
    assert_eq!(*code, Some(7));

    let bundle = bundle.clone().unwrap();
    let log = std::fs::read_to_string(bundle.join("server.log")).unwrap();
    assert!(log.contains("address in use"));
    let meta = read_metadata(&bundle);
    assert_eq!(meta["reason"], "server_exited");
    assert_eq!(meta["server_exit_code"], 7);

    assert!(!sup.is_casting());
    assert!(!fx.config.work_dir.exists());
    assert!(!fx.config.pid_file.exists());
}

#[tokio::test]
async fn test_server_launch_failure_captures_bundle() {
    let fx = Fixture::new(18441);
    let missing = fx.path("no-such-server");
    let mut config = fx.config.clone();
    config.server_command = Some(vec![missing.to_string_lossy().into_owned()]);

    let mut sup = supervisor();
    let err = sup.start(&fx.video, None, config).await.unwrap_err();
    let CastError::ServerStartFailed { source, bundle } = &err else {
        panic!("unexpected error: {:?}", err);
    };
    assert!(matches!(**source, CastError::ServerNotFound(_)));

    // The transcoder was already running, so there is evidence to keep
    let bundle = bundle.clone().unwrap();
    assert_eq!(err.bundle(), Some(bundle.as_path()));
    assert!(bundle.join("transcoder.log").exists());
    assert!(bundle.join("server.log").exists());
    let meta = read_metadata(&bundle);
    assert_eq!(meta["reason"], "server_start_failed");
    assert!(meta["detail"]
        .as_str()
        .unwrap()
        .contains("no-such-server"));

    assert_eq!(sup.state(), SupervisorState::Idle);
    assert!(!fx.config.work_dir.exists());
    assert!(!fx.config.pid_file.exists());
}

#[tokio::test]
async fn test_abandoned_start_returns_to_idle() {
    let fx = Fixture::new(18442);
    let mut config = fx.config.clone();
    // Never writes a playlist, so start() parks in the manifest wait
    config.transcoder_command = sh("exec sleep 30", "fake-ffmpeg");

    let mut sup = supervisor();
    let abandoned = tokio::time::timeout(
        Duration::from_millis(500),
        sup.start(&fx.video, None, config),
    )
    .await;
    assert!(abandoned.is_err(), "start should still be waiting");

    assert_eq!(sup.state(), SupervisorState::Idle);
    assert!(!fx.config.work_dir.exists());

    // Not stuck in AlreadyActive
    sup.start(&fx.video, None, fx.config.clone()).await.unwrap();
    assert!(sup.is_casting());
    sup.stop().await;
}

// =============================================================================
// Recovery
// =============================================================================

/// A process whose command line names `config`'s playlist, as a crashed
/// transcoder's would. The loop keeps `sh` itself alive for `pkill -f`.
fn spawn_orphan(config: &CastConfig) -> std::process::Child {
    std::process::Command::new("sh")
        .arg("-c")
        .arg("while :; do sleep 1; done")
        .arg(config.manifest_path())
        .spawn()
        .unwrap()
}

async fn wait_for_exit(child: &mut std::process::Child) -> bool {
    for _ in 0..40 {
        if child.try_wait().unwrap().is_some() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_orphan_without_pid_file_is_swept() {
    let fx = Fixture::new(18443);
    assert!(!fx.config.pid_file.exists());
    let mut orphan = spawn_orphan(&fx.config);

    let mut sup = supervisor();
    sup.start(&fx.video, None, fx.config.clone()).await.unwrap();
    assert!(wait_for_exit(&mut orphan).await, "orphan survived the sweep");

    sup.stop().await;
}

#[tokio::test]
async fn test_sweep_can_be_disabled() {
    let fx = Fixture::new(18444);
    let mut config = fx.config.clone();
    config.sweep_orphans = false;
    let mut orphan = spawn_orphan(&config);

    let mut sup = supervisor();
    sup.start(&fx.video, None, config).await.unwrap();
    assert!(orphan.try_wait().unwrap().is_none(), "orphan was swept");

    sup.stop().await;
    orphan.kill().unwrap();
    orphan.wait().unwrap();
}


#[tokio::test]
async fn test_stale_pid_file_is_reaped_before_start() {
    let fx = Fixture::new(18440);
    let mut stale = std::process::Command::new("sleep").arg("30").spawn().unwrap();
    std::fs::write(&fx.config.pid_file, format!("{}\n", stale.id())).unwrap();

    let mut sup = supervisor();
    sup.start(&fx.video, None, fx.config.clone()).await.unwrap();

    assert!(wait_for_exit(&mut stale).await, "stale process was not terminated");

    // The manifest now belongs to the new session
    let pids = read_pid_file(&fx.config.pid_file);
    assert_eq!(pids.len(), 2);
    assert!(!pids.contains(&stale.id()));

    sup.stop().await;
}
