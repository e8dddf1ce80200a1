//! Hardware profiling
//!
//! - Profile: immutable capability snapshot plus derived recommendations
//! - Probe: isolated CPU, memory, storage and accelerator probes
//! - Tuning: encoding / transcription / translation views for consumers
//!
//! Detection never fails. Anything that cannot be probed is reported as
//! absent and consumers fall back to CPU-only settings.

pub mod probe;
pub mod profile;
pub mod tuning;

use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use probe::{AcceleratorProbe, DEFAULT_ACCELERATOR_PROBES};
pub use profile::{
    AcceleratorBackend, AcceleratorInfo, HardwareProfile, Recommendations, StorageClass,
};
pub use tuning::{
    EncodingProfile, HwAccel, ModelSize, NvencTuning, TranscriptionProfile, TranslationProfile,
    VideoEncoder,
};

/// User overrides for the derived heuristics (`[hardware]` config section)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareOverrides {
    /// Replace the memory-scaled batch size
    pub batch_size: Option<u32>,
    /// Replace the cores-minus-one worker count
    pub workers: Option<u32>,
    /// Never hand the accelerator to any consumer
    pub force_cpu: bool,
}

/// Detects hardware once and answers tuning queries from the cached snapshot
pub struct HardwareProfiler {
    profile: RwLock<HardwareProfile>,
    overrides: HardwareOverrides,
}

impl HardwareProfiler {
    /// Run full detection with the default accelerator probe order
    pub fn detect() -> Self {
        Self::detect_with(DEFAULT_ACCELERATOR_PROBES)
    }

    /// Run full detection with an explicit accelerator probe order
    pub fn detect_with(probes: &[(AcceleratorBackend, AcceleratorProbe)]) -> Self {
        let mut profile = HardwareProfile::fallback();

        match probe::probe_cpu() {
            Some(cpu) => {
                profile.physical_cores = cpu.physical_cores.max(1);
                profile.logical_cores = cpu.logical_cores.max(profile.physical_cores);
                profile.cpu_freq_max_mhz = cpu.freq_max_mhz;
            }
            None => debug!("CPU probe returned nothing, assuming a single core"),
        }

        match probe::probe_memory() {
            Some((total, available)) => {
                profile.ram_total_mb = total;
                profile.ram_available_mb = available;
            }
            None => debug!("Memory probe returned nothing"),
        }

        profile.storage = probe::probe_storage();
        profile.accelerator = probe::detect_accelerator(probes);

        let profiler = Self::from_profile(profile);
        profiler.log_summary();
        profiler
    }

    /// Wrap an already-known profile (no probing)
    pub fn from_profile(profile: HardwareProfile) -> Self {
        Self {
            profile: RwLock::new(profile),
            overrides: HardwareOverrides::default(),
        }
    }

    pub fn with_overrides(mut self, overrides: HardwareOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn overrides(&self) -> &HardwareOverrides {
        &self.overrides
    }

    /// Snapshot of the current profile
    pub fn profile(&self) -> HardwareProfile {
        self.profile
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Derived recommendations with overrides applied
    pub fn recommendations(&self) -> Recommendations {
        let mut rec = self.profile().recommendations();

        if let Some(batch_size) = self.overrides.batch_size {
            rec.batch_size = batch_size.max(1);
        }
        if let Some(workers) = self.overrides.workers {
            rec.workers = workers.max(1);
        }
        if self.overrides.force_cpu {
            rec.use_accelerator = false;
            rec.reduced_precision = false;
        }

        rec
    }

    pub fn encoding_profile(&self) -> EncodingProfile {
        EncodingProfile::derive(&self.profile(), &self.recommendations())
    }

    pub fn transcription_profile(&self) -> TranscriptionProfile {
        TranscriptionProfile::derive(&self.profile(), &self.recommendations())
    }

    pub fn translation_profile(&self) -> TranslationProfile {
        TranslationProfile::derive(&self.profile(), &self.recommendations())
    }

    /// Re-sample available memory only. Static facts are never re-probed.
    pub fn refresh_live_memory(&self) {
        let ram = probe::probe_memory();
        let backend = self.profile().accelerator.backend;
        let gpu_free = probe::sample_accelerator_free_mb(backend);

        let mut profile = self.profile.write().unwrap_or_else(PoisonError::into_inner);
        if let Some((_, available)) = ram {
            profile.ram_available_mb = available;
        }
        if let Some(free) = gpu_free {
            profile.accelerator.memory_available_mb = free;
        }
    }

    /// Whether a task needing `estimated_mb` of device memory should go to the accelerator
    pub fn should_use_accelerator_for(&self, estimated_mb: u64) -> bool {
        if !self.recommendations().use_accelerator {
            return false;
        }
        self.refresh_live_memory();
        self.profile().accelerator.memory_available_mb >= estimated_mb
    }

    /// Short usage line for status displays, e.g. "RAM: 42% | GPU: 30%"
    pub fn usage_summary(&self) -> String {
        self.refresh_live_memory();
        let profile = self.profile();

        let mut usage = vec![format!("RAM: {:.0}%", profile.ram_percent_used())];
        if let Some(gpu) = profile.accelerator_percent_used() {
            usage.push(format!("GPU: {:.0}%", gpu));
        }
        usage.join(" | ")
    }

    fn log_summary(&self) {
        let profile = self.profile();
        let rec = self.recommendations();

        info!(
            physical_cores = profile.physical_cores,
            logical_cores = profile.logical_cores,
            cpu_mhz = profile.cpu_freq_max_mhz,
            ram_total_mb = profile.ram_total_mb,
            ram_available_mb = profile.ram_available_mb,
            storage = %profile.storage,
            "System resources detected"
        );

        if profile.accelerator.available {
            info!(
                backend = %profile.accelerator.backend,
                name = %profile.accelerator.name,
                memory_total_mb = profile.accelerator.memory_total_mb,
                compute_capability = ?profile.accelerator.compute_capability,
                "Accelerator available"
            );
        } else {
            info!("No accelerator detected, using CPU");
        }

        info!(
            workers = rec.workers,
            batch_size = rec.batch_size,
            reduced_precision = rec.reduced_precision,
            use_accelerator = rec.use_accelerator,
            "Derived tuning"
        );
    }
}
