//! CLI Command Handlers
//!
//! Implements all CLI commands by calling into the library.
//! Each handler takes CLI args and Output, returns ExitCode.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::cli::{
    CastCmd, CastResponse, ExitCode, Output, ProfileCmd, ProfileReport, ServeCmd, StopCmd,
    StopResponse,
};
use crate::config::Config;
use crate::hardware::{HardwareOverrides, HardwareProfiler};
use crate::stream::supervisor::orphan_patterns;
use crate::stream::{process, server, CastError, StreamSupervisor};

/// How often a running `cast` checks that the pipeline is still alive
const WATCH_INTERVAL: Duration = Duration::from_secs(2);

/// Probing shells out to vendor tools, so keep it off the async workers
async fn detect_hardware(overrides: HardwareOverrides) -> HardwareProfiler {
    match tokio::task::spawn_blocking(HardwareProfiler::detect).await {
        Ok(profiler) => profiler.with_overrides(overrides),
        Err(e) => {
            warn!(error = %e, "Hardware detection task failed, using fallback profile");
            HardwareProfiler::from_profile(crate::hardware::HardwareProfile::fallback())
                .with_overrides(overrides)
        }
    }
}

// =============================================================================
// Profile Command
// =============================================================================

pub async fn profile_cmd(cmd: ProfileCmd, config: Config, output: &Output) -> ExitCode {
    let mut overrides = config.hardware;
    if cmd.force_cpu {
        overrides.force_cpu = true;
    }

    let profiler = detect_hardware(overrides).await;
    let report = ProfileReport {
        hardware: profiler.profile(),
        recommendations: profiler.recommendations(),
        encoding: profiler.encoding_profile(),
        transcription: profiler.transcription_profile(),
        translation: profiler.translation_profile(),
        usage: profiler.usage_summary(),
    };

    if let Err(e) = output.print(&report) {
        return output.error(format!("Failed to serialize: {}", e), ExitCode::Error);
    }
    ExitCode::Success
}

// =============================================================================
// Cast Command
// =============================================================================

fn exit_code_for(err: &CastError) -> ExitCode {
    match err {
        CastError::VideoNotFound(_) | CastError::SubtitleNotFound(_) => ExitCode::InvalidArgs,
        CastError::TranscoderNotFound(_) | CastError::ServerNotFound(_) => ExitCode::MissingTool,
        CastError::AlreadyActive => ExitCode::Error,
        CastError::ServerStartFailed { source, .. } => exit_code_for(source),
        _ => ExitCode::CastFailed,
    }
}

pub async fn cast_cmd(cmd: CastCmd, mut config: Config, output: &Output) -> ExitCode {
    cmd.apply(&mut config);

    if !cmd.video.is_file() {
        return output.error(
            format!("Video file not found: {}", cmd.video.display()),
            ExitCode::InvalidArgs,
        );
    }

    let profiler = Arc::new(detect_hardware(config.hardware.clone()).await);
    let encoder = profiler.encoding_profile().encoder;
    output.info(format!("Encoding with {}", encoder));

    let mut supervisor = StreamSupervisor::new(profiler);
    output.info(format!("Starting stream for {}...", cmd.video.display()));

    let url = match supervisor
        .start(&cmd.video, cmd.subtitle.as_deref(), config.cast.clone())
        .await
    {
        Ok(url) => url,
        Err(e) => {
            let bundle = e.bundle().map(|p| p.to_path_buf());
            return output.error_with_bundle(e.to_string(), bundle, exit_code_for(&e));
        }
    };

    let session_id = supervisor
        .session()
        .map(|s| s.id.to_string())
        .unwrap_or_default();

    let response = CastResponse {
        status: "live",
        url: url.clone(),
        session_id,
        video: cmd.video.clone(),
        subtitle: cmd.subtitle.clone(),
        encoder: encoder.to_string(),
    };
    if let Err(e) = output.print(&response) {
        supervisor.stop().await;
        return output.error(format!("Failed to serialize: {}", e), ExitCode::Error);
    }
    output.info(format!("Stream URL: {}", url));
    output.info("Press Ctrl-C to stop");

    let result = watch(&mut supervisor).await;
    supervisor.stop().await;

    match result {
        Ok(()) => {
            output.info("Stream stopped");
            ExitCode::Success
        }
        Err(msg) => output.error(msg, ExitCode::CastFailed),
    }
}

/// Wait for Ctrl-C, or for the pipeline to die on its own
async fn watch(supervisor: &mut StreamSupervisor) -> Result<(), String> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                if let Err(e) = res {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                }
                info!("Interrupted, stopping stream");
                return Ok(());
            }
            _ = tokio::time::sleep(WATCH_INTERVAL) => {
                if !supervisor.is_casting() {
                    return Err("Streaming pipeline exited unexpectedly".to_string());
                }
            }
        }
    }
}

// =============================================================================
// Stop Command
// =============================================================================

pub async fn stop_cmd(cmd: StopCmd, config: Config, output: &Output) -> ExitCode {
    let cast = &config.cast;
    let terminated = process::reap_pid_file(&cast.pid_file).await;

    if !cmd.no_sweep && cast.sweep_orphans {
        process::sweep_patterns(&orphan_patterns(cast)).await;
    }

    output.info(format!("Terminated {} recorded process(es)", terminated));
    if let Err(e) = output.print(StopResponse {
        status: "ok",
        terminated,
    }) {
        return output.error(format!("Failed to serialize: {}", e), ExitCode::Error);
    }
    ExitCode::Success
}

// =============================================================================
// Serve Command
// =============================================================================

pub async fn serve_cmd(cmd: ServeCmd, output: &Output) -> ExitCode {
    if !cmd.dir.is_dir() {
        return output.error(
            format!("Directory not found: {}", cmd.dir.display()),
            ExitCode::InvalidArgs,
        );
    }

    match server::serve(cmd.dir, &cmd.host, cmd.port).await {
        Ok(()) => ExitCode::Success,
        Err(e) => output.error(format!("{:#}", e), ExitCode::Error),
    }
}
