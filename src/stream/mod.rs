//! Live streaming pipeline
//!
//! - Supervisor: owns the transcoder + file server session lifecycle
//! - Transcode: encoder-family aware transcoder arguments
//! - Filter: filtergraph escaping for burned-in subtitles
//! - Process: pid manifest, signalling and orphan sweeps
//! - Diagnostics: failure bundles for post-mortem analysis
//! - Server: the HLS file server run by `lancast serve`

pub mod diagnostics;
pub mod filter;
pub mod process;
pub mod server;
pub mod supervisor;
pub mod transcode;

pub use diagnostics::{FailureReason, FailureReport};
pub use supervisor::{CastError, CastSession, StreamSupervisor, SupervisorState};
pub use transcode::build_transcoder_args;
