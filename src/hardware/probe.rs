//! Individual hardware probes
//!
//! Every probe is isolated: an error or empty result from one never affects
//! another, and nothing here is surfaced to callers as a failure. Accelerator
//! probes shell out to the vendor tools (`nvidia-smi`, `rocm-smi`) the same
//! way the drivers expose them to users.

use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use sysinfo::{CpuRefreshKind, DiskKind, Disks, MemoryRefreshKind, RefreshKind, System};
use tracing::{debug, warn};

use super::profile::{AcceleratorBackend, AcceleratorInfo, StorageClass};

/// Upper bound for any single vendor tool invocation
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

const MB: u64 = 1024 * 1024;

/// A single accelerator backend probe.
///
/// `Ok(None)` means the backend is simply not present; `Err` means the probe
/// itself broke. Both are treated as "absent" by the caller.
pub type AcceleratorProbe = fn() -> Result<Option<AcceleratorInfo>>;

/// Backends in priority order: discrete NVIDIA, discrete AMD, unified memory.
pub const DEFAULT_ACCELERATOR_PROBES: &[(AcceleratorBackend, AcceleratorProbe)] = &[
    (AcceleratorBackend::Cuda, probe_cuda),
    (AcceleratorBackend::Rocm, probe_rocm),
    (AcceleratorBackend::Metal, probe_metal),
];

// =============================================================================
// CPU / Memory
// =============================================================================

/// Core counts and max frequency
#[derive(Debug, Clone, Copy)]
pub struct CpuInfo {
    pub physical_cores: u32,
    pub logical_cores: u32,
    pub freq_max_mhz: u64,
}

pub fn probe_cpu() -> Option<CpuInfo> {
    let system = System::new_with_specifics(
        RefreshKind::nothing().with_cpu(CpuRefreshKind::everything()),
    );

    let logical = match system.cpus().len() {
        0 => std::thread::available_parallelism()
            .map(|n| n.get())
            .ok()?,
        n => n,
    };
    let physical = System::physical_core_count().unwrap_or(logical);

    let freq_max_mhz = read_max_frequency_mhz().unwrap_or_else(|| {
        system
            .cpus()
            .iter()
            .map(|cpu| cpu.frequency())
            .max()
            .unwrap_or(0)
    });

    Some(CpuInfo {
        physical_cores: physical as u32,
        logical_cores: logical as u32,
        freq_max_mhz,
    })
}

/// cpufreq reports the hardware ceiling in kHz; sysinfo only knows the current clock.
#[cfg(target_os = "linux")]
fn read_max_frequency_mhz() -> Option<u64> {
    let raw = std::fs::read_to_string("/sys/devices/system/cpu/cpu0/cpufreq/cpuinfo_max_freq").ok()?;
    raw.trim().parse::<u64>().ok().map(|khz| khz / 1000)
}

#[cfg(not(target_os = "linux"))]
fn read_max_frequency_mhz() -> Option<u64> {
    None
}

/// (total, available) system memory in MB
pub fn probe_memory() -> Option<(u64, u64)> {
    let system = System::new_with_specifics(
        RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
    );
    let total = system.total_memory();
    if total == 0 {
        return None;
    }
    Some((total / MB, system.available_memory() / MB))
}

// =============================================================================
// Storage
// =============================================================================

pub fn probe_storage() -> StorageClass {
    let from_disks = storage_from_disks();
    if from_disks != StorageClass::Unknown {
        return from_disks;
    }

    if cfg!(target_os = "macos") {
        // Every Mac sold in the last decade boots from flash
        return StorageClass::SolidState;
    }

    #[cfg(target_os = "linux")]
    match run_probe_command("lsblk", &["-d", "-o", "name,rota"]) {
        Ok(Some(output)) => return parse_lsblk_rota(&output),
        Ok(None) => debug!("lsblk unavailable"),
        Err(e) => debug!(error = %e, "lsblk probe failed"),
    }

    StorageClass::Unknown
}

/// Disk kind of whatever holds the root (or system) mount point
fn storage_from_disks() -> StorageClass {
    let disks = Disks::new_with_refreshed_list();
    let root = disks.list().iter().find(|disk| {
        let mount = disk.mount_point();
        mount == std::path::Path::new("/") || mount == std::path::Path::new("C:\\")
    });

    match root.map(|disk| disk.kind()) {
        Some(DiskKind::SSD) => StorageClass::SolidState,
        Some(DiskKind::HDD) => StorageClass::Rotational,
        _ => StorageClass::Unknown,
    }
}

/// Parse `lsblk -d -o name,rota` output.
///
/// Any real block device with `rota=0` means solid-state storage is present.
/// Loop, zram and ramdisk devices always report 0 and are ignored.
pub fn parse_lsblk_rota(output: &str) -> StorageClass {
    let mut seen_device = false;

    for line in output.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 {
            continue;
        }
        let name = parts[0];
        if name.starts_with("loop") || name.starts_with("zram") || name.starts_with("ram") {
            continue;
        }
        seen_device = true;
        if parts[1] == "0" {
            return StorageClass::SolidState;
        }
    }

    if seen_device {
        StorageClass::Rotational
    } else {
        StorageClass::Unknown
    }
}

// =============================================================================
// Accelerators
// =============================================================================

/// Run probes in order, first success wins
pub fn detect_accelerator(probes: &[(AcceleratorBackend, AcceleratorProbe)]) -> AcceleratorInfo {
    for (backend, probe) in probes {
        match probe() {
            Ok(Some(info)) => {
                debug!(backend = %backend, name = %info.name, "Accelerator detected");
                return info;
            }
            Ok(None) => debug!(backend = %backend, "Accelerator backend not present"),
            Err(e) => debug!(backend = %backend, error = %e, "Accelerator probe failed"),
        }
    }

    AcceleratorInfo::none()
}

/// NVIDIA via `nvidia-smi`
pub fn probe_cuda() -> Result<Option<AcceleratorInfo>> {
    // compute_cap is only queryable on newer drivers
    let with_cc = run_probe_command(
        "nvidia-smi",
        &[
            "--query-gpu=name,memory.total,memory.free,compute_cap",
            "--format=csv,noheader,nounits",
        ],
    )?;

    let output = match with_cc {
        Some(output) => output,
        None => match run_probe_command(
            "nvidia-smi",
            &[
                "--query-gpu=name,memory.total,memory.free",
                "--format=csv,noheader,nounits",
            ],
        )? {
            Some(output) => output,
            None => return Ok(None),
        },
    };

    parse_nvidia_smi(&output)
        .map(Some)
        .ok_or_else(|| anyhow!("unrecognised nvidia-smi output: {:?}", output.trim()))
}

/// Parse the first GPU line of
/// `nvidia-smi --query-gpu=name,memory.total,memory.free[,compute_cap] --format=csv,noheader,nounits`
///
/// Example: `NVIDIA GeForce RTX 3080, 10240, 9876, 8.6`
pub fn parse_nvidia_smi(output: &str) -> Option<AcceleratorInfo> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 3 {
        return None;
    }

    let name = fields[0].to_string();
    if name.is_empty() {
        return None;
    }
    let memory_total_mb = fields[1].parse::<u64>().ok()?;
    let memory_available_mb = fields[2].parse::<u64>().unwrap_or(memory_total_mb);
    let compute_capability = fields.get(3).and_then(|cc| parse_compute_capability(cc));

    Some(AcceleratorInfo {
        available: true,
        backend: AcceleratorBackend::Cuda,
        name,
        memory_total_mb,
        memory_available_mb,
        compute_capability,
    })
}

/// "8.6" -> (8, 6); "[N/A]" -> None
fn parse_compute_capability(raw: &str) -> Option<(u32, u32)> {
    let (major, minor) = raw.trim().split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// AMD via `rocm-smi`
pub fn probe_rocm() -> Result<Option<AcceleratorInfo>> {
    let output = match run_probe_command(
        "rocm-smi",
        &["--showproductname", "--showmeminfo", "vram", "--json"],
    )? {
        Some(output) => output,
        None => return Ok(None),
    };

    parse_rocm_smi(&output).map(Some)
}

/// Parse `rocm-smi --showproductname --showmeminfo vram --json`
pub fn parse_rocm_smi(output: &str) -> Result<AcceleratorInfo> {
    let json: serde_json::Value =
        serde_json::from_str(output.trim()).context("rocm-smi returned invalid JSON")?;

    let cards = json
        .as_object()
        .ok_or_else(|| anyhow!("rocm-smi JSON is not an object"))?;

    let (_, card) = cards
        .iter()
        .find(|(key, _)| key.starts_with("card"))
        .ok_or_else(|| anyhow!("rocm-smi reported no cards"))?;

    let field = |key: &str| card.get(key).and_then(|v| v.as_str()).map(str::trim);
    let bytes = |key: &str| field(key).and_then(|v| v.parse::<u64>().ok());

    let name = field("Card series")
        .or_else(|| field("Card model"))
        .filter(|n| !n.is_empty())
        .unwrap_or("AMD GPU")
        .to_string();

    let total = bytes("VRAM Total Memory (B)").unwrap_or(0);
    let used = bytes("VRAM Total Used Memory (B)").unwrap_or(0);

    Ok(AcceleratorInfo {
        available: true,
        backend: AcceleratorBackend::Rocm,
        name,
        memory_total_mb: total / MB,
        memory_available_mb: total.saturating_sub(used) / MB,
        compute_capability: None,
    })
}

/// Apple Silicon shares system memory with its GPU
#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
pub fn probe_metal() -> Result<Option<AcceleratorInfo>> {
    let (total, available) = probe_memory().unwrap_or((0, 0));
    Ok(Some(AcceleratorInfo {
        available: true,
        backend: AcceleratorBackend::Metal,
        name: "Apple Silicon GPU".to_string(),
        memory_total_mb: total,
        memory_available_mb: available,
        compute_capability: None,
    }))
}

#[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
pub fn probe_metal() -> Result<Option<AcceleratorInfo>> {
    Ok(None)
}

/// Re-sample free device memory without a full probe
pub fn sample_accelerator_free_mb(backend: AcceleratorBackend) -> Option<u64> {
    match backend {
        AcceleratorBackend::Cuda => {
            let output = run_probe_command(
                "nvidia-smi",
                &["--query-gpu=memory.free", "--format=csv,noheader,nounits"],
            )
            .ok()??;
            output.lines().next()?.trim().parse().ok()
        }
        AcceleratorBackend::Rocm => probe_rocm().ok()?.map(|info| info.memory_available_mb),
        AcceleratorBackend::Metal => probe_memory().map(|(_, available)| available),
        AcceleratorBackend::None => None,
    }
}

// =============================================================================
// Command helper
// =============================================================================

/// Run a vendor tool with a hard timeout.
///
/// Returns `Ok(None)` when the tool is not installed or exits unsuccessfully,
/// `Err` when it hangs or its output cannot be read.
fn run_probe_command(program: &str, args: &[&str]) -> Result<Option<String>> {
    let mut child = match Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("failed to run {}", program)),
    };

    // Drain stdout concurrently so a chatty tool never blocks on a full pipe
    let reader = child.stdout.take().map(|mut pipe| {
        std::thread::spawn(move || {
            let mut stdout = String::new();
            pipe.read_to_string(&mut stdout).map(|_| stdout)
        })
    });

    let deadline = Instant::now() + PROBE_TIMEOUT;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            warn!(program, "Hardware probe timed out");
            return Err(anyhow!("{} timed out after {:?}", program, PROBE_TIMEOUT));
        }
        std::thread::sleep(Duration::from_millis(20));
    };

    let stdout = match reader {
        Some(handle) => handle
            .join()
            .map_err(|_| anyhow!("{} output reader panicked", program))??,
        None => String::new(),
    };

    if !status.success() {
        return Ok(None);
    }
    Ok(Some(stdout))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_run_probe_command_reads_output_larger_than_pipe() {
        let stdout = run_probe_command("sh", &["-c", "yes 0123456789 | head -n 20000"])
            .unwrap()
            .unwrap();
        assert_eq!(stdout.len(), 220_000);
    }

    #[cfg(unix)]
    #[test]
    fn test_run_probe_command_failed_tool_is_absent() {
        assert!(run_probe_command("sh", &["-c", "echo partial; exit 1"])
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_parse_nvidia_smi_with_compute_cap() {
        let gpu = parse_nvidia_smi("NVIDIA GeForce RTX 3080, 10240, 9876, 8.6\n").unwrap();
        assert_eq!(gpu.backend, AcceleratorBackend::Cuda);
        assert_eq!(gpu.name, "NVIDIA GeForce RTX 3080");
        assert_eq!(gpu.memory_total_mb, 10240);
        assert_eq!(gpu.memory_available_mb, 9876);
        assert_eq!(gpu.compute_capability, Some((8, 6)));
        assert!(gpu.available);
    }

    #[test]
    fn test_parse_nvidia_smi_without_compute_cap() {
        let gpu = parse_nvidia_smi("Tesla K80, 11441, 11400, [N/A]").unwrap();
        assert_eq!(gpu.compute_capability, None);

        let gpu = parse_nvidia_smi("Tesla K80, 11441, 11400").unwrap();
        assert_eq!(gpu.compute_capability, None);
    }

    #[test]
    fn test_parse_nvidia_smi_uses_first_gpu() {
        let output = "NVIDIA A100-SXM4-40GB, 40960, 40000, 8.0\nNVIDIA A100-SXM4-40GB, 40960, 100, 8.0\n";
        let gpu = parse_nvidia_smi(output).unwrap();
        assert_eq!(gpu.memory_available_mb, 40000);
    }

    #[test]
    fn test_parse_nvidia_smi_rejects_garbage() {
        assert!(parse_nvidia_smi("").is_none());
        assert!(parse_nvidia_smi("NVIDIA-SMI has failed").is_none());
        assert!(parse_nvidia_smi("GPU, lots, none").is_none());
    }

    #[test]
    fn test_parse_rocm_smi() {
        let output = r#"{
            "card0": {
                "Card series": "Navi 21 [Radeon RX 6800/6800 XT / 6900 XT]",
                "Card model": "0x73bf",
                "VRAM Total Memory (B)": "17163091968",
                "VRAM Total Used Memory (B)": "1073741824"
            }
        }"#;
        let gpu = parse_rocm_smi(output).unwrap();
        assert_eq!(gpu.backend, AcceleratorBackend::Rocm);
        assert!(gpu.name.starts_with("Navi 21"));
        assert_eq!(gpu.memory_total_mb, 16368);
        assert_eq!(gpu.memory_available_mb, 15344);
    }

    #[test]
    fn test_parse_rocm_smi_errors() {
        assert!(parse_rocm_smi("not json").is_err());
        assert!(parse_rocm_smi("{}").is_err());
        assert!(parse_rocm_smi("[]").is_err());
    }

    #[test]
    fn test_parse_lsblk() {
        let ssd = "NAME ROTA\nloop0    0\nsda      1\nnvme0n1  0\n";
        assert_eq!(parse_lsblk_rota(ssd), StorageClass::SolidState);

        let hdd = "NAME ROTA\nloop0    0\nsda      1\n";
        assert_eq!(parse_lsblk_rota(hdd), StorageClass::Rotational);

        assert_eq!(parse_lsblk_rota("NAME ROTA\n"), StorageClass::Unknown);
    }

    #[test]
    fn test_detect_accelerator_falls_through() {
        fn broken() -> Result<Option<AcceleratorInfo>> {
            Err(anyhow!("driver exploded"))
        }
        fn absent() -> Result<Option<AcceleratorInfo>> {
            Ok(None)
        }

        let info = detect_accelerator(&[
            (AcceleratorBackend::Cuda, broken),
            (AcceleratorBackend::Rocm, absent),
        ]);
        assert!(!info.available);
        assert_eq!(info.backend, AcceleratorBackend::None);
    }

    #[test]
    fn test_run_probe_command_missing_tool() {
        let result = run_probe_command("definitely-not-a-real-gpu-tool", &[]).unwrap();
        assert!(result.is_none());
    }
}
