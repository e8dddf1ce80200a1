//! Child process bookkeeping
//!
//! Pid manifest persistence, signalling arbitrary pids left over from an
//! earlier run, command-line pattern sweeps, and bounded shutdown of the
//! children we own.

use std::io;
use std::path::Path;
use std::time::Duration;

use tokio::process::Child;
use tracing::{debug, warn};

/// Grace between SIGTERM and SIGKILL for pids recovered from the manifest
pub const STALE_PID_GRACE: Duration = Duration::from_millis(500);

const LIVENESS_POLL: Duration = Duration::from_millis(50);

// =============================================================================
// Pid manifest
// =============================================================================

/// Read recorded pids. A missing or garbled file yields whatever parses.
pub fn read_pid_file(path: &Path) -> Vec<u32> {
    match std::fs::read_to_string(path) {
        Ok(contents) => contents
            .split_whitespace()
            .filter_map(|token| token.parse::<u32>().ok())
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Write pids as a single space-separated line
pub fn write_pid_file(path: &Path, pids: &[u32]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let line = pids
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    std::fs::write(path, format!("{}\n", line))
}

/// Remove the manifest, ignoring a file that is already gone
pub fn remove_pid_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove pid file");
        }
    }
}

// =============================================================================
// Arbitrary pids
// =============================================================================

/// Pids we must never signal: init/kernel and ourselves
fn is_protected(pid: u32) -> bool {
    pid <= 1 || pid == std::process::id()
}

/// Whether a process with this pid exists
#[cfg(unix)]
pub fn is_pid_running(pid: u32) -> bool {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs permission and existence checks only
    let rc = unsafe { libc::kill(raw, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_pid_running(pid: u32) -> bool {
    std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {}", pid), "/NH"])
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let raw = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: plain syscall on a validated pid
    if unsafe { libc::kill(raw, signal) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Terminate a pid we do not own: SIGTERM, wait up to `grace`, then SIGKILL.
/// Returns true if anything was signalled.
#[cfg(unix)]
pub async fn terminate_pid(pid: u32, grace: Duration) -> bool {
    if is_protected(pid) {
        debug!(pid, "Refusing to signal protected pid");
        return false;
    }

    if let Err(e) = send_signal(pid, libc::SIGTERM) {
        if e.raw_os_error() == Some(libc::ESRCH) {
            debug!(pid, "Stale pid already gone");
        } else {
            warn!(pid, error = %e, "Failed to send SIGTERM");
        }
        return false;
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !is_pid_running(pid) {
            return true;
        }
        tokio::time::sleep(LIVENESS_POLL).await;
    }

    if let Err(e) = send_signal(pid, libc::SIGKILL) {
        if e.raw_os_error() != Some(libc::ESRCH) {
            warn!(pid, error = %e, "Failed to send SIGKILL");
        }
    }
    true
}

#[cfg(not(unix))]
pub async fn terminate_pid(pid: u32, _grace: Duration) -> bool {
    if is_protected(pid) {
        return false;
    }
    match tokio::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .output()
        .await
    {
        Ok(out) => out.status.success(),
        Err(e) => {
            warn!(pid, error = %e, "taskkill failed");
            false
        }
    }
}

/// Terminate every pid listed in the manifest, then delete it
pub async fn reap_pid_file(path: &Path) -> usize {
    let pids = read_pid_file(path);
    let mut signalled = 0;
    for pid in &pids {
        if terminate_pid(*pid, STALE_PID_GRACE).await {
            signalled += 1;
        }
    }
    if path.exists() {
        debug!(path = %path.display(), pids = ?pids, signalled, "Cleared stale pid file");
        remove_pid_file(path);
    }
    signalled
}

/// `pkill -f` each pattern. Failures are logged only.
pub async fn sweep_patterns(patterns: &[String]) {
    if !cfg!(unix) {
        return;
    }
    for pattern in patterns {
        match tokio::process::Command::new("pkill")
            .arg("-f")
            .arg(pattern)
            .output()
            .await
        {
            // pkill exits 1 when nothing matched
            Ok(out) if out.status.success() => debug!(%pattern, "Swept orphaned processes"),
            Ok(_) => {}
            Err(e) => debug!(%pattern, error = %e, "pkill unavailable"),
        }
    }
}

// =============================================================================
// Owned children
// =============================================================================

/// Stop a child we spawned: graceful signal, bounded wait, then kill.
/// Returns the exit code when one was observed.
pub async fn shutdown_child(child: &mut Child, name: &str, timeout: Duration) -> Option<i32> {
    if let Ok(Some(status)) = child.try_wait() {
        return status.code();
    }

    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            if let Err(e) = send_signal(pid, libc::SIGTERM) {
                debug!(process = name, pid, error = %e, "SIGTERM failed");
            }
        }
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(process = name, ?status, "Exited after terminate");
            status.code()
        }
        Ok(Err(e)) => {
            warn!(process = name, error = %e, "Failed waiting for child");
            None
        }
        Err(_) => {
            warn!(process = name, "Did not exit in time, killing");
            if let Err(e) = child.kill().await {
                warn!(process = name, error = %e, "Kill failed");
            }
            None
        }
    }
}
