use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::error::ApiError;
use crate::ffmpeg;

const AUDIO_TRANSCODE_TIMEOUT_SECONDS: u64 = 600;
const DEFAULT_AUDIO_BITRATE: &str = "192k";

/// User-supplied processing parameters for one audio edit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioEditOptions {
    pub codec: String,
    pub bitrate: Option<String>,
    pub quality: Option<u32>,
    pub channels: Option<u32>,
    pub sample_rate: Option<u32>,
    pub trim_start: Option<f64>,
    pub trim_end: Option<f64>,
    pub fade_in: bool,
    pub fade_in_duration: f64,
    pub fade_out: bool,
    pub fade_out_duration: f64,
    pub cut_middle_start: Option<f64>,
    pub cut_middle_end: Option<f64>,
    pub crossfade: bool,
    pub crossfade_duration: f64,
    pub volume: f64,
}

impl Default for AudioEditOptions {
    fn default() -> Self {
        Self {
            codec: "mp3".to_string(),
            bitrate: None,
            quality: None,
            channels: None,
            sample_rate: None,
            trim_start: None,
            trim_end: None,
            fade_in: false,
            fade_in_duration: 3.0,
            fade_out: false,
            fade_out_duration: 3.0,
            cut_middle_start: None,
            cut_middle_end: None,
            crossfade: false,
            crossfade_duration: 2.0,
            volume: 100.0,
        }
    }
}

impl AudioEditOptions {
    fn cut_range(&self) -> Option<(f64, f64)> {
        match (self.cut_middle_start, self.cut_middle_end) {
            (Some(start), Some(end)) => Some((start, end)),
            _ => None,
        }
    }

    fn has_trim(&self) -> bool {
        self.trim_start.is_some() || self.trim_end.is_some()
    }

    fn has_fade(&self) -> bool {
        self.fade_in || self.fade_out
    }

    fn wants_volume(&self) -> bool {
        (self.volume - 100.0).abs() > f64::EPSILON
    }

    /// Whether any requested option requires decoding and re-encoding the
    /// stream. Plain trim is excluded: it can run as a container-level seek.
    fn needs_reencode_filters(&self) -> bool {
        self.has_fade()
            || self.crossfade
            || self.cut_range().is_some()
            || self.wants_volume()
            || self.channels.is_some()
            || self.sample_rate.is_some()
    }
}

struct CodecSpec {
    /// `None` means bitstream copy.
    encoder: Option<&'static str>,
    extension: &'static str,
    lossless: bool,
}

fn codec_spec(codec: &str) -> Result<CodecSpec, ApiError> {
    let spec = match codec {
        "mp3" => CodecSpec { encoder: Some("libmp3lame"), extension: "mp3", lossless: false },
        "aac" | "m4a" => CodecSpec { encoder: Some("aac"), extension: "m4a", lossless: false },
        "opus" => CodecSpec { encoder: Some("libopus"), extension: "opus", lossless: false },
        "ogg" | "vorbis" => CodecSpec { encoder: Some("libvorbis"), extension: "ogg", lossless: false },
        "flac" => CodecSpec { encoder: Some("flac"), extension: "flac", lossless: true },
        "wav" => CodecSpec { encoder: Some("pcm_s16le"), extension: "wav", lossless: true },
        "copy" => CodecSpec { encoder: None, extension: "m4a", lossless: true },
        other => {
            return Err(ApiError::bad_request(format!(
                "Unsupported audio codec: {other}"
            )));
        }
    };
    Ok(spec)
}

/// The decided shape of one processing run: an optional container-level
/// seek, an optional filter expression, and the predicted output duration.
#[derive(Debug, PartialEq)]
pub struct FilterPlan {
    pub input_seek: Option<(f64, Option<f64>)>,
    pub filter: Option<String>,
    pub is_complex: bool,
    pub expected_duration: Option<f64>,
}

fn validate(options: &AudioEditOptions) -> Result<(), ApiError> {
    codec_spec(&options.codec)?;

    match (options.cut_middle_start, options.cut_middle_end) {
        (Some(start), Some(end)) if end <= start => {
            return Err(ApiError::bad_request(
                "Cut-middle end must be after cut-middle start.",
            ));
        }
        (Some(_), None) | (None, Some(_)) => {
            return Err(ApiError::bad_request(
                "Cut-middle requires both a start and an end.",
            ));
        }
        _ => {}
    }

    if let (Some(start), Some(end)) = (options.trim_start, options.trim_end)
        && end <= start
    {
        return Err(ApiError::bad_request("Trim end must be after trim start."));
    }

    if options.codec == "copy" && options.needs_reencode_filters() {
        return Err(ApiError::bad_request(
            "Codec 'copy' cannot be combined with fades, cuts, volume or resampling.",
        ));
    }

    Ok(())
}

/// Early validation hook for the HTTP boundary: catches inconsistent
/// options before any background work starts.
pub fn validate_options(options: &AudioEditOptions) -> Result<(), ApiError> {
    validate(options)
}

/// Fade-out window relative to the effective post-trim duration. When the
/// effective duration is unknown or not longer than the fade, the entire
/// remaining audio fades instead of failing.
fn fade_out_window(effective: Option<f64>, fade_duration: f64) -> (f64, f64) {
    match effective {
        Some(duration) if duration > fade_duration => (duration - fade_duration, fade_duration),
        Some(duration) => (0.0, duration),
        None => (0.0, fade_duration),
    }
}

/// Builds the processing plan for one edit. Pure: all probing (source
/// duration) happens before this call.
pub fn build_filter_plan(
    options: &AudioEditOptions,
    source_duration: Option<f64>,
) -> Result<FilterPlan, ApiError> {
    validate(options)?;

    if let Some((cut_start, cut_end)) = options.cut_range() {
        return Ok(cut_middle_plan(options, source_duration, cut_start, cut_end));
    }

    let trim_start = options.trim_start.unwrap_or(0.0);
    let effective = match (options.trim_start, options.trim_end) {
        (_, Some(end)) => Some(end - trim_start),
        (Some(start), None) => source_duration.map(|d| d - start),
        (None, None) => source_duration,
    };

    if !options.has_fade() && !options.wants_volume() {
        // Cheap container-level seek; nothing needs the decoded stream.
        let input_seek = options
            .has_trim()
            .then_some((trim_start, options.trim_end));
        return Ok(FilterPlan {
            input_seek,
            filter: None,
            is_complex: false,
            expected_duration: effective,
        });
    }

    // Fade positions are relative to the trimmed duration, so the trim must
    // run in the filter graph with timestamps reset to a zero-based timeline.
    let mut chain: Vec<String> = Vec::new();
    if options.has_trim() {
        let trim = match options.trim_end {
            Some(end) => format!("atrim=start={trim_start}:end={end}"),
            None => format!("atrim=start={trim_start}"),
        };
        chain.push(trim);
        chain.push("asetpts=PTS-STARTPTS".to_string());
    }
    chain.extend(edge_filters(options, effective));

    Ok(FilterPlan {
        input_seek: None,
        filter: Some(chain.join(",")),
        is_complex: false,
        expected_duration: effective,
    })
}

/// Split/rejoin graph: head `[0, cutStart]` and tail `[cutEnd, end]`,
/// joined by a crossfade or a hard concat. With crossfade enabled each
/// segment extends by half the crossfade duration toward the cut so the
/// overlap consumes material centered on the cut points and the output
/// duration equals total minus cut length. Ordinary trim is ignored here.
fn cut_middle_plan(
    options: &AudioEditOptions,
    source_duration: Option<f64>,
    cut_start: f64,
    cut_end: f64,
) -> FilterPlan {
    let half_overlap = if options.crossfade {
        options.crossfade_duration / 2.0
    } else {
        0.0
    };
    let head_end = cut_start + half_overlap;
    let tail_start = cut_end - half_overlap;
    let expected = source_duration.map(|total| total - (cut_end - cut_start));

    let join = if options.crossfade {
        format!(
            "[head][tail]acrossfade=d={}[joined]",
            options.crossfade_duration
        )
    } else {
        "[head][tail]concat=n=2:v=0:a=1[joined]".to_string()
    };

    let extras = edge_filters(options, expected);
    let finish = if extras.is_empty() {
        "anull".to_string()
    } else {
        extras.join(",")
    };

    let graph = format!(
        "[0:a]atrim=0:{head_end},asetpts=PTS-STARTPTS[head];\
         [0:a]atrim=start={tail_start},asetpts=PTS-STARTPTS[tail];\
         {join};[joined]{finish}[out]"
    );

    FilterPlan {
        input_seek: None,
        filter: Some(graph),
        is_complex: true,
        expected_duration: expected,
    }
}

/// Fade-in, fade-out and volume filters applied to the (already trimmed or
/// rejoined) stream, in that order.
fn edge_filters(options: &AudioEditOptions, effective: Option<f64>) -> Vec<String> {
    let mut filters = Vec::new();
    if options.fade_in {
        filters.push(format!("afade=t=in:st=0:d={}", options.fade_in_duration));
    }
    if options.fade_out {
        let (start, duration) = fade_out_window(effective, options.fade_out_duration);
        filters.push(format!("afade=t=out:st={start}:d={duration}"));
    }
    if options.wants_volume() {
        filters.push(format!("volume={}", options.volume / 100.0));
    }
    filters
}

/// Full ffmpeg argument list for one processing run.
pub fn build_ffmpeg_args(
    input: &Path,
    output: &Path,
    options: &AudioEditOptions,
    plan: &FilterPlan,
) -> Result<Vec<String>, ApiError> {
    let spec = codec_spec(&options.codec)?;
    let mut args = Vec::new();

    if let Some((start, end)) = plan.input_seek {
        args.push("-ss".to_string());
        args.push(start.to_string());
        if let Some(end) = end {
            args.push("-to".to_string());
            args.push(end.to_string());
        }
    }

    args.push("-i".to_string());
    args.push(input.to_string_lossy().to_string());
    args.push("-vn".to_string());

    if let Some(filter) = &plan.filter {
        if plan.is_complex {
            args.push("-filter_complex".to_string());
            args.push(filter.clone());
            args.push("-map".to_string());
            args.push("[out]".to_string());
        } else {
            args.push("-af".to_string());
            args.push(filter.clone());
        }
    }

    args.push("-c:a".to_string());
    match spec.encoder {
        None => args.push("copy".to_string()),
        Some(encoder) => {
            args.push(encoder.to_string());
            if !spec.lossless {
                if let Some(quality) = options.quality {
                    args.push("-q:a".to_string());
                    args.push(quality.to_string());
                } else {
                    args.push("-b:a".to_string());
                    args.push(
                        options
                            .bitrate
                            .clone()
                            .unwrap_or_else(|| DEFAULT_AUDIO_BITRATE.to_string()),
                    );
                }
            }
            if let Some(channels) = options.channels {
                args.push("-ac".to_string());
                args.push(channels.to_string());
            }
            if let Some(rate) = options.sample_rate {
                args.push("-ar".to_string());
                args.push(rate.to_string());
            }
        }
    }

    args.push(output.to_string_lossy().to_string());
    Ok(args)
}

pub fn output_extension(options: &AudioEditOptions) -> Result<&'static str, ApiError> {
    Ok(codec_spec(&options.codec)?.extension)
}

/// Applies `options` to the audio of `input` (video inputs have their audio
/// extracted) and writes the processed file into `out_dir`.
pub async fn process_audio(
    input: &Path,
    out_dir: &Path,
    options: &AudioEditOptions,
) -> Result<PathBuf, ApiError> {
    let source_duration = ffmpeg::probe_duration(input).await;
    let plan = build_filter_plan(options, source_duration)?;

    let output = out_dir.join(format!("audio.{}", output_extension(options)?));
    let args = build_ffmpeg_args(input, &output, options, &plan)?;

    ffmpeg::run_ffmpeg(&args, Duration::from_secs(AUDIO_TRANSCODE_TIMEOUT_SECONDS)).await?;

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fade_out_starts_before_the_end() {
        assert_eq!(fade_out_window(Some(30.0), 3.0), (27.0, 3.0));
    }

    #[test]
    fn short_clip_fades_entirely() {
        assert_eq!(fade_out_window(Some(2.0), 3.0), (0.0, 2.0));
    }

    #[test]
    fn unknown_duration_fades_from_start() {
        assert_eq!(fade_out_window(None, 3.0), (0.0, 3.0));
    }

    #[test]
    fn cut_middle_with_crossfade_keeps_duration() {
        let options = AudioEditOptions {
            cut_middle_start: Some(20.0),
            cut_middle_end: Some(40.0),
            crossfade: true,
            crossfade_duration: 2.0,
            ..Default::default()
        };
        let plan = build_filter_plan(&options, Some(60.0)).unwrap();
        // 20s head + 20s tail; the 2s overlap eats 1s from each side of the cut.
        assert_eq!(plan.expected_duration, Some(40.0));
        let filter = plan.filter.unwrap();
        assert!(filter.contains("atrim=0:21"));
        assert!(filter.contains("atrim=start=39"));
        assert!(filter.contains("acrossfade=d=2"));
        assert!(plan.is_complex);
    }

    #[test]
    fn cut_middle_without_crossfade_concatenates() {
        let options = AudioEditOptions {
            cut_middle_start: Some(20.0),
            cut_middle_end: Some(40.0),
            ..Default::default()
        };
        let plan = build_filter_plan(&options, Some(60.0)).unwrap();
        assert_eq!(plan.expected_duration, Some(40.0));
        let filter = plan.filter.unwrap();
        assert!(filter.contains("atrim=0:20"));
        assert!(filter.contains("atrim=start=40"));
        assert!(filter.contains("concat=n=2:v=0:a=1"));
    }

    #[test]
    fn cut_middle_ignores_plain_trim() {
        let options = AudioEditOptions {
            cut_middle_start: Some(10.0),
            cut_middle_end: Some(20.0),
            trim_start: Some(5.0),
            trim_end: Some(55.0),
            ..Default::default()
        };
        let plan = build_filter_plan(&options, Some(60.0)).unwrap();
        assert_eq!(plan.expected_duration, Some(50.0));
        assert!(!plan.filter.unwrap().contains("atrim=start=5"));
    }

    #[test]
    fn trim_with_fade_runs_in_the_filter_graph() {
        let options = AudioEditOptions {
            trim_start: Some(0.0),
            trim_end: Some(30.0),
            fade_out: true,
            ..Default::default()
        };
        let plan = build_filter_plan(&options, Some(120.0)).unwrap();
        assert_eq!(plan.input_seek, None);
        let filter = plan.filter.unwrap();
        assert!(filter.contains("asetpts=PTS-STARTPTS"));
        // Fade position is relative to the trimmed 30s, not the 120s source.
        assert!(filter.contains("afade=t=out:st=27:d=3"));
    }

    #[test]
    fn trim_without_fade_uses_container_seek() {
        let options = AudioEditOptions {
            trim_start: Some(5.0),
            trim_end: Some(25.0),
            ..Default::default()
        };
        let plan = build_filter_plan(&options, Some(60.0)).unwrap();
        assert_eq!(plan.input_seek, Some((5.0, Some(25.0))));
        assert_eq!(plan.filter, None);
        assert_eq!(plan.expected_duration, Some(20.0));
    }

    #[test]
    fn volume_is_a_linear_gain_filter() {
        let options = AudioEditOptions {
            volume: 50.0,
            ..Default::default()
        };
        let plan = build_filter_plan(&options, Some(60.0)).unwrap();
        assert_eq!(plan.filter.as_deref(), Some("volume=0.5"));
    }

    #[test]
    fn cut_middle_requires_both_bounds() {
        let options = AudioEditOptions {
            cut_middle_start: Some(10.0),
            ..Default::default()
        };
        assert!(build_filter_plan(&options, Some(60.0)).is_err());
    }

    #[test]
    fn inverted_ranges_are_rejected() {
        let cut = AudioEditOptions {
            cut_middle_start: Some(40.0),
            cut_middle_end: Some(20.0),
            ..Default::default()
        };
        assert!(build_filter_plan(&cut, None).is_err());

        let trim = AudioEditOptions {
            trim_start: Some(30.0),
            trim_end: Some(10.0),
            ..Default::default()
        };
        assert!(build_filter_plan(&trim, None).is_err());
    }

    #[test]
    fn copy_rejects_reencode_filters() {
        let options = AudioEditOptions {
            codec: "copy".to_string(),
            fade_in: true,
            ..Default::default()
        };
        assert!(build_filter_plan(&options, None).is_err());
    }

    #[test]
    fn copy_allows_container_level_trim() {
        let options = AudioEditOptions {
            codec: "copy".to_string(),
            trim_start: Some(10.0),
            trim_end: Some(20.0),
            ..Default::default()
        };
        let plan = build_filter_plan(&options, Some(60.0)).unwrap();
        assert_eq!(plan.input_seek, Some((10.0, Some(20.0))));
        assert_eq!(plan.filter, None);

        let args =
            build_ffmpeg_args(Path::new("in.m4a"), Path::new("out.m4a"), &options, &plan).unwrap();
        let copy_at = args.iter().position(|a| a == "-c:a").unwrap();
        assert_eq!(args[copy_at + 1], "copy");
    }

    #[test]
    fn lossless_targets_skip_bitrate_flags() {
        let options = AudioEditOptions {
            codec: "flac".to_string(),
            ..Default::default()
        };
        let plan = build_filter_plan(&options, None).unwrap();
        let args =
            build_ffmpeg_args(Path::new("in.wav"), Path::new("out.flac"), &options, &plan).unwrap();
        assert!(!args.contains(&"-b:a".to_string()));
        assert!(!args.contains(&"-q:a".to_string()));
    }

    #[test]
    fn lossy_default_bitrate_applies() {
        let options = AudioEditOptions::default();
        let plan = build_filter_plan(&options, None).unwrap();
        let args =
            build_ffmpeg_args(Path::new("in.m4a"), Path::new("out.mp3"), &options, &plan).unwrap();
        let bitrate_at = args.iter().position(|a| a == "-b:a").unwrap();
        assert_eq!(args[bitrate_at + 1], "192k");
        assert!(args.contains(&"libmp3lame".to_string()));
    }

    #[test]
    fn explicit_quality_replaces_bitrate() {
        let options = AudioEditOptions {
            quality: Some(0),
            ..Default::default()
        };
        let plan = build_filter_plan(&options, None).unwrap();
        let args =
            build_ffmpeg_args(Path::new("in.m4a"), Path::new("out.mp3"), &options, &plan).unwrap();
        assert!(args.contains(&"-q:a".to_string()));
        assert!(!args.contains(&"-b:a".to_string()));
    }

    #[test]
    fn unknown_codec_is_rejected() {
        let options = AudioEditOptions {
            codec: "midi".to_string(),
            ..Default::default()
        };
        assert!(build_filter_plan(&options, None).is_err());
    }
}
