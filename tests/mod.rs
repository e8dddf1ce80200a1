//! Integration tests for lancast
//!
//! Tests are organized by component:
//! - hardware_test: probe chain, profile detection and tuning
//! - transcode_test: transcoder argument construction per encoder
//! - supervisor_test: session lifecycle with stand-in child processes
//! - server_test: HLS file server headers and CORS
//! - cli_test: argument parsing, JSON envelope, binary runs

// Note: Each test file is a separate integration test crate
// Tests are run individually by cargo, not via mod.rs
