//! Consumer-specific tuning views derived from a `HardwareProfile`

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::profile::{AcceleratorBackend, HardwareProfile, Recommendations};

/// VAAPI render node used when encoding on AMD
pub const DEFAULT_VAAPI_DEVICE: &str = "/dev/dri/renderD128";

// =============================================================================
// Encoding
// =============================================================================

/// H.264 encoder implementation handed to the transcoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoEncoder {
    Libx264,
    Nvenc,
    Vaapi,
    VideoToolbox,
}

impl VideoEncoder {
    /// ffmpeg `-c:v` value
    pub fn codec_name(&self) -> &'static str {
        match self {
            VideoEncoder::Libx264 => "libx264",
            VideoEncoder::Nvenc => "h264_nvenc",
            VideoEncoder::Vaapi => "h264_vaapi",
            VideoEncoder::VideoToolbox => "h264_videotoolbox",
        }
    }

    pub fn is_hardware(&self) -> bool {
        !matches!(self, VideoEncoder::Libx264)
    }
}

impl fmt::Display for VideoEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.codec_name())
    }
}

/// Hardware decode path (`-hwaccel`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum HwAccel {
    Cuda,
    Vaapi { device: String },
    VideoToolbox,
}

impl HwAccel {
    pub fn name(&self) -> &'static str {
        match self {
            HwAccel::Cuda => "cuda",
            HwAccel::Vaapi { .. } => "vaapi",
            HwAccel::VideoToolbox => "videotoolbox",
        }
    }
}

/// NVENC-only knobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvencTuning {
    /// p1 (fastest) .. p7 (slowest)
    pub preset: String,
    pub rate_control: String,
    pub gpu_index: u32,
}

impl Default for NvencTuning {
    fn default() -> Self {
        Self {
            preset: "p4".to_string(),
            rate_control: "vbr".to_string(),
            gpu_index: 0,
        }
    }
}

/// Transcoder settings for this machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodingProfile {
    pub encoder: VideoEncoder,
    pub hwaccel: Option<HwAccel>,
    pub threads: u32,
    /// Software encoder speed/quality preset
    pub preset: String,
    /// Rate-control buffer size (`-bufsize`)
    pub buffer_size: String,
    pub nvenc: Option<NvencTuning>,
}

impl EncodingProfile {
    pub fn derive(profile: &HardwareProfile, rec: &Recommendations) -> Self {
        let ssd = profile.storage.is_solid_state();
        let buffer_size = if ssd { "8M" } else { "4M" }.to_string();
        let threads = rec.workers;

        let backend = if rec.use_accelerator {
            profile.accelerator.backend
        } else {
            AcceleratorBackend::None
        };

        let (encoder, hwaccel, nvenc) = match backend {
            AcceleratorBackend::Cuda => (
                VideoEncoder::Nvenc,
                Some(HwAccel::Cuda),
                Some(NvencTuning::default()),
            ),
            AcceleratorBackend::Rocm => (
                VideoEncoder::Vaapi,
                Some(HwAccel::Vaapi {
                    device: DEFAULT_VAAPI_DEVICE.to_string(),
                }),
                None,
            ),
            AcceleratorBackend::Metal => {
                (VideoEncoder::VideoToolbox, Some(HwAccel::VideoToolbox), None)
            }
            AcceleratorBackend::None => (VideoEncoder::Libx264, None, None),
        };

        let preset = if encoder == VideoEncoder::Libx264 {
            if profile.physical_cores >= 4 {
                "veryfast"
            } else {
                "ultrafast"
            }
        } else if ssd {
            "fast"
        } else {
            "medium"
        }
        .to_string();

        Self {
            encoder,
            hwaccel,
            threads,
            preset,
            buffer_size,
            nvenc,
        }
    }

    /// Software-only profile, used when no hardware information is wanted
    pub fn software(threads: u32) -> Self {
        Self {
            encoder: VideoEncoder::Libx264,
            hwaccel: None,
            threads,
            preset: "veryfast".to_string(),
            buffer_size: "4M".to_string(),
            nvenc: None,
        }
    }
}

// =============================================================================
// Transcription
// =============================================================================

/// Speech model size ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelSize {
    /// Largest model the free memory comfortably holds
    pub fn for_profile(profile: &HardwareProfile, use_accelerator: bool) -> Self {
        if !use_accelerator {
            return match profile.ram_available_mb {
                0..=1999 => ModelSize::Tiny,
                2000..=3999 => ModelSize::Base,
                _ => ModelSize::Small,
            };
        }

        match profile.accelerator.memory_available_mb {
            10_000.. => ModelSize::Large,
            5_000..=9_999 => ModelSize::Medium,
            2_000..=4_999 => ModelSize::Small,
            _ => ModelSize::Base,
        }
    }
}

/// Settings for the speech-to-text collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionProfile {
    /// "cpu", "cuda", "rocm" or "metal"
    pub device: String,
    pub fp16: bool,
    pub compute_type: String,
    pub beam_size: u32,
    pub best_of: u32,
    pub condition_on_previous_text: bool,
    pub compression_ratio_threshold: f32,
    pub no_speech_threshold: f32,
    /// CPU threads; 0 lets the accelerated runtime decide
    pub threads: u32,
    pub model: ModelSize,
}

impl TranscriptionProfile {
    pub fn derive(profile: &HardwareProfile, rec: &Recommendations) -> Self {
        let gpu = rec.use_accelerator;
        let fp16 = gpu && rec.reduced_precision;

        Self {
            device: if gpu {
                profile.accelerator.backend.as_str().to_string()
            } else {
                "cpu".to_string()
            },
            fp16,
            compute_type: if fp16 { "float16" } else { "float32" }.to_string(),
            beam_size: if gpu { 5 } else { 1 },
            best_of: if gpu { 5 } else { 1 },
            condition_on_previous_text: gpu,
            compression_ratio_threshold: 2.4,
            no_speech_threshold: 0.6,
            threads: if gpu { 0 } else { rec.workers },
            model: ModelSize::for_profile(profile, gpu),
        }
    }
}

// =============================================================================
// Translation
// =============================================================================

/// Settings for the subtitle translation collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationProfile {
    pub batch_size: u32,
    pub cache_size: u32,
    pub workers: u32,
    /// Pause between remote requests
    pub rate_limit_delay: Duration,
}

impl TranslationProfile {
    pub fn derive(profile: &HardwareProfile, rec: &Recommendations) -> Self {
        let available = profile.ram_available_mb;
        let (batch_size, cache_size) = if available > 8000 {
            (50, 5000)
        } else if available > 4000 {
            (30, 3000)
        } else {
            (10, 1000)
        };

        Self {
            batch_size,
            cache_size,
            workers: rec.workers.min(4),
            rate_limit_delay: if available > 4000 {
                Duration::from_millis(200)
            } else {
                Duration::from_millis(500)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::profile::{AcceleratorInfo, StorageClass};

    fn cpu_box(cores: u32, ram_available_mb: u64) -> HardwareProfile {
        HardwareProfile {
            physical_cores: cores,
            logical_cores: cores * 2,
            cpu_freq_max_mhz: 3600,
            ram_total_mb: 16_000,
            ram_available_mb,
            storage: StorageClass::SolidState,
            accelerator: AcceleratorInfo::none(),
        }
    }

    #[test]
    fn test_software_encoding_profile() {
        let profile = cpu_box(8, 8000);
        let enc = EncodingProfile::derive(&profile, &profile.recommendations());
        assert_eq!(enc.encoder, VideoEncoder::Libx264);
        assert!(enc.hwaccel.is_none());
        assert_eq!(enc.threads, 7);
        assert_eq!(enc.preset, "veryfast");
        assert_eq!(enc.buffer_size, "8M");

        let small = cpu_box(2, 8000);
        let enc = EncodingProfile::derive(&small, &small.recommendations());
        assert_eq!(enc.preset, "ultrafast");
    }

    #[test]
    fn test_rotational_storage_uses_smaller_buffer() {
        let mut profile = cpu_box(4, 8000);
        profile.storage = StorageClass::Rotational;
        let enc = EncodingProfile::derive(&profile, &profile.recommendations());
        assert_eq!(enc.buffer_size, "4M");
    }

    #[test]
    fn test_accelerator_ignored_when_not_recommended() {
        let mut profile = cpu_box(4, 8000);
        profile.accelerator = AcceleratorInfo {
            available: true,
            backend: AcceleratorBackend::Rocm,
            name: "Radeon".to_string(),
            memory_total_mb: 8192,
            memory_available_mb: 8000,
            compute_capability: None,
        };
        let mut rec = profile.recommendations();
        let enc = EncodingProfile::derive(&profile, &rec);
        assert_eq!(enc.encoder, VideoEncoder::Vaapi);

        rec.use_accelerator = false;
        let enc = EncodingProfile::derive(&profile, &rec);
        assert_eq!(enc.encoder, VideoEncoder::Libx264);
    }

    #[test]
    fn test_translation_tiers() {
        let big = cpu_box(8, 12_000);
        let t = TranslationProfile::derive(&big, &big.recommendations());
        assert_eq!((t.batch_size, t.cache_size, t.workers), (50, 5000, 4));
        assert_eq!(t.rate_limit_delay, Duration::from_millis(200));

        let small = cpu_box(2, 1_000);
        let t = TranslationProfile::derive(&small, &small.recommendations());
        assert_eq!((t.batch_size, t.cache_size, t.workers), (10, 1000, 1));
        assert_eq!(t.rate_limit_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_cpu_transcription_profile() {
        let profile = cpu_box(6, 3_000);
        let t = TranscriptionProfile::derive(&profile, &profile.recommendations());
        assert_eq!(t.device, "cpu");
        assert!(!t.fp16);
        assert_eq!(t.compute_type, "float32");
        assert_eq!(t.beam_size, 1);
        assert_eq!(t.threads, 5);
        assert_eq!(t.model, ModelSize::Base);
    }
}
