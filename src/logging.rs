//! Tracing setup for the `lancast` binary
//!
//! Logs go to stderr so `--json` output on stdout stays machine-readable.
//! `RUST_LOG` takes precedence over the verbosity flags.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Level name for a `-v` count; `quiet` drops to warnings only
pub fn level_for(verbosity: u8, quiet: bool) -> &'static str {
    if quiet {
        return "warn";
    }
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Default directive set for a level
pub fn default_directives(level: &str) -> String {
    format!("lancast={level},tower_http={level},warn")
}

/// Install the global subscriber. Calling it twice is harmless.
pub fn init(verbosity: u8, quiet: bool) {
    let level = level_for(verbosity, quiet);
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(verbosity > 0)
        .with_filter(env_filter);

    if tracing_subscriber::registry()
        .with(stderr_layer)
        .try_init()
        .is_ok()
    {
        tracing::debug!(level, "Logging initialized");
    }
}
