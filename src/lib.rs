//! lancast - adaptive live casting over the local network
//!
//! Profiles the host once, then supervises a transcoder and an HLS file
//! server so a local video becomes a live stream other devices can open.
//!
//! # Modules
//!
//! - `hardware` - CPU, memory, storage and accelerator profiling plus tuning views
//! - `stream` - the cast session supervisor, transcoder arguments and file server
//! - `config` - config file and cast session settings
//! - `cli` / `commands` - the `lancast` command line
//! - `logging` - tracing subscriber setup

pub mod cli;
pub mod commands;
pub mod config;
pub mod hardware;
pub mod logging;
pub mod stream;

// Re-export commonly used types
pub use config::{CastConfig, Config};
pub use hardware::{
    AcceleratorBackend, AcceleratorInfo, EncodingProfile, HardwareOverrides, HardwareProfile,
    HardwareProfiler, TranscriptionProfile, TranslationProfile,
};
pub use stream::{CastError, StreamSupervisor, SupervisorState};
