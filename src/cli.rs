//! CLI - Command Line Interface for lancast
//!
//! Scriptable front end to the library. All output is JSON-parseable.
//!
//! # Examples
//!
//! ```bash
//! # What will this machine use for encoding?
//! lancast profile --json
//!
//! # Cast a file with burned-in subtitles until Ctrl-C
//! lancast cast movie.mkv --subtitle movie.en.srt --port 8080
//!
//! # Clean up after a crash
//! lancast stop
//! ```

use clap::{ArgAction, Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::io::IsTerminal;
use std::path::PathBuf;

use crate::config::Config;
use crate::hardware::{
    EncodingProfile, HardwareProfile, Recommendations, TranscriptionProfile, TranslationProfile,
};

// =============================================================================
// Exit Codes
// =============================================================================

/// Exit codes for CLI operations (semantic for scripting)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Success
    Success = 0,
    /// General error
    Error = 1,
    /// Invalid arguments
    InvalidArgs = 2,
    /// Transcoder or file server binary missing
    MissingTool = 3,
    /// Cast session failed to start
    CastFailed = 4,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> i32 {
        code as i32
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> std::process::ExitCode {
        std::process::ExitCode::from(code as u8)
    }
}

// =============================================================================
// Main CLI Structure
// =============================================================================

/// lancast - cast local video to any device on the LAN as a live HLS stream
#[derive(Parser, Debug)]
#[command(
    name = "lancast",
    version,
    author = "Gorka & Hermes",
    about = "Cast local video to any device on the LAN as a live HLS stream",
    long_about = "Profiles this machine's CPU, memory, storage and GPU, picks the \
                  best encoder it can drive, and supervises a transcoder plus an \
                  HTTP file server so other devices can open the stream.",
    after_help = "EXAMPLES:\n\
                  lancast profile                      Show hardware and tuning\n\
                  lancast cast movie.mkv               Cast until Ctrl-C\n\
                  lancast cast movie.mkv -s en.srt     Burn in subtitles\n\
                  lancast stop                         Kill leftovers from a crash"
)]
pub struct Cli {
    /// Output format as JSON (default for non-TTY)
    #[arg(long, short = 'j', global = true)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(long, short = 'v', global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Check if JSON output should be used
    pub fn should_json(&self) -> bool {
        self.json || !std::io::stdout().is_terminal()
    }

    /// Config from `--config`, or the default location
    pub fn load_config(&self) -> Config {
        match &self.config {
            Some(path) => Config::load_from(path),
            None => Config::load(),
        }
    }
}

// =============================================================================
// Subcommands
// =============================================================================

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Detect hardware and print the derived tuning
    #[command(visible_alias = "p")]
    Profile(ProfileCmd),

    /// Cast a video file until interrupted
    Cast(CastCmd),

    /// Terminate processes left behind by an earlier session
    Stop(StopCmd),

    /// Serve an HLS directory (launched by `cast`)
    #[command(hide = true)]
    Serve(ServeCmd),
}

// =============================================================================
// Profile Command
// =============================================================================

/// Show hardware profile and derived settings
#[derive(Args, Debug)]
pub struct ProfileCmd {
    /// Report CPU-only settings even if an accelerator is present
    #[arg(long)]
    pub force_cpu: bool,
}

// =============================================================================
// Cast Command
// =============================================================================

/// Start a cast session
#[derive(Args, Debug)]
pub struct CastCmd {
    /// Video file to cast
    #[arg(required = true)]
    pub video: PathBuf,

    /// Subtitle file to burn in
    #[arg(long, short = 's')]
    pub subtitle: Option<PathBuf>,

    /// HTTP port for the stream
    #[arg(long, short = 'p')]
    pub port: Option<u16>,

    /// Bind address for the file server
    #[arg(long)]
    pub host: Option<String>,

    /// Output height in pixels (0 keeps the source size)
    #[arg(long)]
    pub height: Option<u32>,

    /// Constant quality value (lower is better)
    #[arg(long)]
    pub crf: Option<u32>,

    /// Seconds to wait for the first playlist
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Transcoder binary
    #[arg(long, value_name = "PATH")]
    pub ffmpeg: Option<String>,

    /// Never use the GPU
    #[arg(long)]
    pub force_cpu: bool,
}

impl CastCmd {
    /// Apply flag overrides on top of file configuration
    pub fn apply(&self, config: &mut Config) {
        let cast = &mut config.cast;
        if let Some(port) = self.port {
            cast.port = port;
        }
        if let Some(host) = &self.host {
            cast.host = host.clone();
        }
        if let Some(height) = self.height {
            cast.target_height = height;
        }
        if let Some(crf) = self.crf {
            cast.video_crf = crf;
        }
        if let Some(timeout) = self.timeout {
            cast.startup_timeout_secs = timeout;
        }
        if let Some(ffmpeg) = &self.ffmpeg {
            cast.transcoder_command = vec![ffmpeg.clone()];
        }
        if self.force_cpu {
            config.hardware.force_cpu = true;
        }
    }
}

// =============================================================================
// Stop / Serve Commands
// =============================================================================

/// Stop a previous session's processes
#[derive(Args, Debug)]
pub struct StopCmd {
    /// Only use the pid file, skip the process-table sweep
    #[arg(long)]
    pub no_sweep: bool,
}

/// Serve a directory of HLS files
#[derive(Args, Debug)]
pub struct ServeCmd {
    /// Directory to serve
    #[arg(long, required = true)]
    pub dir: PathBuf,

    /// Port to listen on
    #[arg(long, default_value = "8080")]
    pub port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,
}

// =============================================================================
// JSON Output Types
// =============================================================================

/// Generic JSON output wrapper with status
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonOutput<T: Serialize> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle: Option<PathBuf>,
    #[serde(skip_serializing_if = "is_zero")]
    pub exit_code: i32,
}

fn is_zero(n: &i32) -> bool {
    *n == 0
}

impl<T: Serialize> JsonOutput<T> {
    /// Create success output with data
    pub fn success(data: T) -> Self {
        Self {
            data: Some(data),
            error: None,
            bundle: None,
            exit_code: 0,
        }
    }

    /// Create error output (no data)
    pub fn error_msg(msg: impl Into<String>, code: ExitCode) -> JsonOutput<()> {
        JsonOutput::<()> {
            data: None,
            error: Some(msg.into()),
            bundle: None,
            exit_code: code.into(),
        }
    }
}

/// `profile` response
#[derive(Debug, Serialize)]
pub struct ProfileReport {
    pub hardware: HardwareProfile,
    pub recommendations: Recommendations,
    pub encoding: EncodingProfile,
    pub transcription: TranscriptionProfile,
    pub translation: TranslationProfile,
    pub usage: String,
}

/// `cast` response, printed once the stream is live
#[derive(Debug, Serialize)]
pub struct CastResponse {
    pub status: &'static str,
    pub url: String,
    pub session_id: String,
    pub video: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<PathBuf>,
    pub encoder: String,
}

/// `stop` response
#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub status: &'static str,
    /// Processes signalled from the pid file
    pub terminated: usize,
}

// =============================================================================
// Output Helpers
// =============================================================================

/// Output handler for consistent formatting
pub struct Output {
    pub json: bool,
    pub quiet: bool,
}

impl Output {
    pub fn new(cli: &Cli) -> Self {
        Self {
            json: cli.should_json(),
            quiet: cli.quiet,
        }
    }

    /// Print success data
    pub fn print<T: Serialize>(&self, data: T) -> anyhow::Result<()> {
        if self.json {
            let output = JsonOutput::success(data);
            println!("{}", serde_json::to_string_pretty(&output)?);
        } else {
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
        Ok(())
    }

    /// Print error and return exit code
    pub fn error(&self, msg: impl Into<String>, code: ExitCode) -> ExitCode {
        self.error_with_bundle(msg, None, code)
    }

    /// Print error pointing at a failure bundle
    pub fn error_with_bundle(
        &self,
        msg: impl Into<String>,
        bundle: Option<PathBuf>,
        code: ExitCode,
    ) -> ExitCode {
        let msg = msg.into();
        if self.json {
            let mut output = JsonOutput::<()>::error_msg(&msg, code);
            output.bundle = bundle;
            if let Ok(json) = serde_json::to_string_pretty(&output) {
                eprintln!("{}", json);
            }
        } else if !self.quiet {
            eprintln!("Error: {}", msg);
            if let Some(bundle) = bundle {
                eprintln!("Diagnostics saved to {}", bundle.display());
            }
        }
        code
    }

    /// Print info message (suppressed in quiet mode)
    pub fn info(&self, msg: impl std::fmt::Display) {
        if !self.quiet && !self.json {
            eprintln!("{}", msg);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
