//! Transcoder (ffmpeg) invocation builder
//!
//! Turns an `EncodingProfile` plus a `CastConfig` into the argument list for a
//! looping, real-time HLS encode. Rate and quality options are spelled
//! differently by every encoder family, so that part branches on the encoder.

use std::path::Path;

use crate::config::{CastConfig, SEGMENT_PATTERN};
use crate::hardware::{EncodingProfile, HwAccel, VideoEncoder};

use super::filter::subtitle_filter;

/// Target bitrate for encoders without a quality mode when no cap is configured
const FALLBACK_VIDEO_BITRATE: &str = "6000k";

/// Build transcoder arguments (without the program itself)
pub fn build_transcoder_args(
    profile: &EncodingProfile,
    config: &CastConfig,
    input: &Path,
    subtitle: Option<&Path>,
) -> Vec<String> {
    let segment_dir = config.segment_dir();
    let mut args: Vec<String> = Vec::with_capacity(64);

    let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

    push(&["-hide_banner", "-loglevel", "warning", "-nostdin"]);
    // Input: native rate, loop forever
    push(&["-re", "-stream_loop", "-1"]);

    match &profile.hwaccel {
        Some(HwAccel::Vaapi { device }) => {
            push(&["-hwaccel", "vaapi", "-vaapi_device", device.as_str()]);
        }
        Some(accel) => push(&["-hwaccel", accel.name()]),
        None => {}
    }

    args.push("-i".to_string());
    args.push(input.to_string_lossy().into_owned());

    args.push("-vf".to_string());
    args.push(video_filters(profile, config, subtitle).join(","));

    args.push("-c:v".to_string());
    args.push(profile.encoder.codec_name().to_string());
    args.extend(encoder_args(profile, config));

    if !config.video_maxrate.is_empty() {
        args.push("-maxrate".to_string());
        args.push(config.video_maxrate.clone());
    }
    args.push("-bufsize".to_string());
    args.push(
        config
            .video_bufsize
            .clone()
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| profile.buffer_size.clone()),
    );

    // Keyframe on every segment boundary so segments start cleanly
    args.push("-force_key_frames".to_string());
    args.push(format!(
        "expr:gte(t,n_forced*{})",
        config.segment_duration_secs.max(1)
    ));

    args.extend([
        "-c:a".to_string(),
        "aac".to_string(),
        "-ac".to_string(),
        config.audio_channels.to_string(),
        "-b:a".to_string(),
        config.audio_bitrate.clone(),
    ]);

    args.extend([
        "-f".to_string(),
        "hls".to_string(),
        "-hls_time".to_string(),
        config.segment_duration_secs.to_string(),
        "-hls_list_size".to_string(),
        config.retained_segments.to_string(),
        "-hls_flags".to_string(),
        "delete_segments+append_list".to_string(),
        "-hls_segment_filename".to_string(),
        segment_dir.join(SEGMENT_PATTERN).to_string_lossy().into_owned(),
        config.manifest_path().to_string_lossy().into_owned(),
    ]);

    args
}

/// `-vf` chain: subtitle burn-in, scale, then pixel format normalisation
fn video_filters(
    profile: &EncodingProfile,
    config: &CastConfig,
    subtitle: Option<&Path>,
) -> Vec<String> {
    let mut filters = Vec::new();

    if let Some(path) = subtitle {
        filters.push(subtitle_filter(path));
    }

    if config.target_height > 0 {
        filters.push(format!("scale=-2:{}", config.target_height));
    }

    match profile.encoder {
        // Frames are filtered in system memory and uploaded for the VAAPI encoder
        VideoEncoder::Vaapi => filters.push("format=nv12,hwupload".to_string()),
        _ => filters.push("format=yuv420p".to_string()),
    }

    filters
}

/// Encoder-family specific rate/quality options
fn encoder_args(profile: &EncodingProfile, config: &CastConfig) -> Vec<String> {
    let quality = config.video_crf.to_string();

    let args: Vec<String> = match profile.encoder {
        VideoEncoder::Libx264 => {
            let preset = if config.video_preset.is_empty() {
                profile.preset.clone()
            } else {
                config.video_preset.clone()
            };
            vec![
                "-preset".into(),
                preset,
                "-threads".into(),
                profile.threads.to_string(),
                "-crf".into(),
                quality,
                "-profile:v".into(),
                config.video_profile.clone(),
                "-level:v".into(),
                config.video_level.clone(),
                "-pix_fmt".into(),
                "yuv420p".into(),
            ]
        }
        VideoEncoder::Nvenc => {
            let nvenc = profile.nvenc.clone().unwrap_or_default();
            vec![
                "-preset".into(),
                nvenc.preset,
                "-rc".into(),
                nvenc.rate_control,
                "-cq".into(),
                quality,
                "-gpu".into(),
                nvenc.gpu_index.to_string(),
                "-profile:v".into(),
                config.video_profile.clone(),
                "-level:v".into(),
                config.video_level.clone(),
                "-pix_fmt".into(),
                "yuv420p".into(),
            ]
        }
        VideoEncoder::Vaapi => vec![
            "-qp".into(),
            quality,
            "-profile:v".into(),
            config.video_profile.clone(),
        ],
        // VideoToolbox has no portable constant-quality mode; target the cap instead
        VideoEncoder::VideoToolbox => vec![
            "-b:v".into(),
            if config.video_maxrate.is_empty() {
                FALLBACK_VIDEO_BITRATE.to_string()
            } else {
                config.video_maxrate.clone()
            },
            "-profile:v".into(),
            config.video_profile.clone(),
            "-pix_fmt".into(),
            "yuv420p".into(),
        ],
    };

    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_software_args_shape() {
        let mut config = CastConfig::default();
        config.work_dir = PathBuf::from("/tmp/lc");
        let args = build_transcoder_args(
            &EncodingProfile::software(3),
            &config,
            Path::new("/videos/movie.mkv"),
            None,
        );

        assert_eq!(
            &args[..7],
            &["-hide_banner", "-loglevel", "warning", "-nostdin", "-re", "-stream_loop", "-1"]
        );
        assert_eq!(value_after(&args, "-i"), Some("/videos/movie.mkv"));
        assert_eq!(value_after(&args, "-vf"), Some("scale=-2:1080,format=yuv420p"));
        assert_eq!(value_after(&args, "-c:v"), Some("libx264"));
        assert_eq!(value_after(&args, "-threads"), Some("3"));
        assert_eq!(value_after(&args, "-crf"), Some("21"));
        assert_eq!(value_after(&args, "-bufsize"), Some("4M"));
        assert_eq!(value_after(&args, "-hls_list_size"), Some("5"));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/lc/hls/stream.m3u8"));
        assert!(!args.contains(&"-hwaccel".to_string()));
    }

    #[test]
    fn test_bufsize_override() {
        let mut config = CastConfig::default();
        config.video_bufsize = Some("12000k".to_string());
        let args = build_transcoder_args(
            &EncodingProfile::software(1),
            &config,
            Path::new("in.mp4"),
            None,
        );
        assert_eq!(value_after(&args, "-bufsize"), Some("12000k"));
    }

    #[test]
    fn test_zero_height_skips_scale() {
        let mut config = CastConfig::default();
        config.target_height = 0;
        let args = build_transcoder_args(
            &EncodingProfile::software(1),
            &config,
            Path::new("in.mp4"),
            None,
        );
        assert_eq!(value_after(&args, "-vf"), Some("format=yuv420p"));
    }
}
