//! Hardware profile data structures
//!
//! A `HardwareProfile` is an immutable snapshot taken at startup. Only the
//! available-memory fields are ever rewritten (see `HardwareProfiler::refresh_live_memory`).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Device name families where half precision has proven reliable
const FP16_KNOWN_GOOD_FAMILIES: &[&str] = &["RTX", "A100", "A10", "H100", "L40", "L4", "T4"];

/// Minimum CUDA compute capability for reduced precision (Turing)
const FP16_MIN_COMPUTE: (u32, u32) = (7, 5);

/// Storage class of the system disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageClass {
    SolidState,
    Rotational,
    #[default]
    Unknown,
}

impl StorageClass {
    pub fn is_solid_state(&self) -> bool {
        matches!(self, StorageClass::SolidState)
    }
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageClass::SolidState => write!(f, "SSD"),
            StorageClass::Rotational => write!(f, "HDD"),
            StorageClass::Unknown => write!(f, "unknown"),
        }
    }
}

/// Accelerator backend, in detection priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceleratorBackend {
    #[default]
    None,
    /// NVIDIA discrete GPU
    Cuda,
    /// AMD discrete GPU
    Rocm,
    /// Apple Silicon integrated GPU (unified memory)
    Metal,
}

impl AcceleratorBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            AcceleratorBackend::None => "none",
            AcceleratorBackend::Cuda => "cuda",
            AcceleratorBackend::Rocm => "rocm",
            AcceleratorBackend::Metal => "metal",
        }
    }
}

impl fmt::Display for AcceleratorBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// GPU (or similar) compute device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceleratorInfo {
    pub available: bool,
    pub backend: AcceleratorBackend,
    pub name: String,
    /// Device memory in MB
    pub memory_total_mb: u64,
    pub memory_available_mb: u64,
    /// CUDA compute capability (major, minor)
    pub compute_capability: Option<(u32, u32)>,
}

impl AcceleratorInfo {
    /// The "no accelerator" value
    pub fn none() -> Self {
        Self {
            available: false,
            backend: AcceleratorBackend::None,
            name: "None".to_string(),
            memory_total_mb: 0,
            memory_available_mb: 0,
            compute_capability: None,
        }
    }

    /// Whether the device is modern enough AND from a family known to handle fp16.
    ///
    /// Compute capability alone is not trusted across vendors, so both must hold.
    pub fn supports_reduced_precision(&self) -> bool {
        if !self.available || self.backend != AcceleratorBackend::Cuda {
            return false;
        }

        let modern = self
            .compute_capability
            .map(|cc| cc >= FP16_MIN_COMPUTE)
            .unwrap_or(false);

        let name = self.name.to_uppercase();
        let known_family = FP16_KNOWN_GOOD_FAMILIES
            .iter()
            .any(|family| name.contains(family));

        modern && known_family
    }
}

impl Default for AcceleratorInfo {
    fn default() -> Self {
        Self::none()
    }
}

/// Derived tuning hints. Consumers must stay correct if these are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendations {
    pub workers: u32,
    pub batch_size: u32,
    pub reduced_precision: bool,
    pub use_accelerator: bool,
}

/// Hardware profile of the system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub physical_cores: u32,
    pub logical_cores: u32,
    /// Max CPU frequency in MHz (0 when unknown)
    pub cpu_freq_max_mhz: u64,
    /// System memory in MB
    pub ram_total_mb: u64,
    pub ram_available_mb: u64,
    pub storage: StorageClass,
    pub accelerator: AcceleratorInfo,
}

impl HardwareProfile {
    /// Conservative profile used when nothing could be detected
    pub fn fallback() -> Self {
        Self {
            physical_cores: 1,
            logical_cores: 1,
            cpu_freq_max_mhz: 0,
            ram_total_mb: 0,
            ram_available_mb: 0,
            storage: StorageClass::Unknown,
            accelerator: AcceleratorInfo::none(),
        }
    }

    /// Physical cores minus one for the controlling process, minimum 1.
    pub fn recommended_workers(&self) -> u32 {
        std::cmp::max(1, self.physical_cores.saturating_sub(1))
    }

    /// Batch size heuristic.
    ///
    /// With an accelerator: ~32 units per GB of free device memory, clamped to [8, 64].
    /// Without: ~1 unit per 100 MB of free RAM, clamped to [4, 32].
    pub fn recommended_batch_size(&self) -> u32 {
        if self.accelerator.available {
            let gpu_batch = (self.accelerator.memory_available_mb / 1024) * 32;
            gpu_batch.clamp(8, 64) as u32
        } else {
            let ram_batch = self.ram_available_mb / 100;
            ram_batch.clamp(4, 32) as u32
        }
    }

    pub fn recommendations(&self) -> Recommendations {
        Recommendations {
            workers: self.recommended_workers(),
            batch_size: self.recommended_batch_size(),
            reduced_precision: self.accelerator.supports_reduced_precision(),
            use_accelerator: self.accelerator.available,
        }
    }

    /// Percentage of system RAM in use
    pub fn ram_percent_used(&self) -> f64 {
        if self.ram_total_mb == 0 {
            return 0.0;
        }
        let used = self.ram_total_mb.saturating_sub(self.ram_available_mb);
        used as f64 / self.ram_total_mb as f64 * 100.0
    }

    /// Percentage of accelerator memory in use, if there is one
    pub fn accelerator_percent_used(&self) -> Option<f64> {
        let gpu = &self.accelerator;
        if !gpu.available || gpu.memory_total_mb == 0 {
            return None;
        }
        let used = gpu.memory_total_mb.saturating_sub(gpu.memory_available_mb);
        Some(used as f64 / gpu.memory_total_mb as f64 * 100.0)
    }
}
