use std::path::Path;

use tokio::time::Duration;
use tracing::{info, warn};

use crate::ffmpeg;

/// Codecs with poor playback support in the browsers we deliver to.
const INCOMPATIBLE_CODECS: &[&str] = &["av01", "av1"];

const CONVERT_MIN_TIMEOUT_SECONDS: u64 = 120;
const CONVERT_MAX_TIMEOUT_SECONDS: u64 = 1800;
const CONVERT_SECONDS_PER_MEDIA_SECOND: f64 = 2.0;

#[derive(Debug, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Codec already plays back widely; nothing done.
    Compatible,
    /// File was re-encoded and atomically replaced.
    Converted,
    /// Re-encode failed or timed out; the original file is delivered as-is.
    Skipped(String),
}

/// Probes the produced file's video codec and re-encodes in place when it
/// uses a codec from the incompatible set. Never fails the task: a failed or
/// timed-out conversion leaves the original untouched and returns `Skipped`.
pub async fn verify_and_convert(path: &Path) -> VerifyOutcome {
    let Some(codec) = ffmpeg::probe_video_codec(path).await else {
        return VerifyOutcome::Compatible;
    };

    if !INCOMPATIBLE_CODECS.iter().any(|c| codec.starts_with(c)) {
        return VerifyOutcome::Compatible;
    }

    info!("Produced file uses {codec}; re-encoding for compatibility");

    let duration = ffmpeg::probe_duration(path).await;
    let time_limit = conversion_timeout(duration);

    let converted = path.with_extension("converted.mp4");
    let args = vec![
        "-i".to_string(),
        path.to_string_lossy().to_string(),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-crf".to_string(),
        "23".to_string(),
        "-preset".to_string(),
        "fast".to_string(),
        "-c:a".to_string(),
        "copy".to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
        converted.to_string_lossy().to_string(),
    ];

    match ffmpeg::run_ffmpeg(&args, time_limit).await {
        Ok(()) => match tokio::fs::rename(&converted, path).await {
            Ok(()) => VerifyOutcome::Converted,
            Err(error) => {
                let _ = tokio::fs::remove_file(&converted).await;
                warn!("Could not replace original with converted file: {error}");
                VerifyOutcome::Skipped(format!(
                    "Converted file could not be moved into place: {error}"
                ))
            }
        },
        Err(error) => {
            let _ = tokio::fs::remove_file(&converted).await;
            warn!("Compatibility re-encode failed, delivering original: {error}");
            VerifyOutcome::Skipped(format!(
                "File uses the {codec} codec and could not be converted; some players may not support it."
            ))
        }
    }
}

/// Timeout scaled linearly with the probed media duration, clamped between
/// fixed lower and upper bounds. An unknown duration gets the lower bound.
fn conversion_timeout(duration: Option<f64>) -> Duration {
    let seconds = duration
        .map(|d| (d * CONVERT_SECONDS_PER_MEDIA_SECOND) as u64)
        .unwrap_or(CONVERT_MIN_TIMEOUT_SECONDS)
        .clamp(CONVERT_MIN_TIMEOUT_SECONDS, CONVERT_MAX_TIMEOUT_SECONDS);
    Duration::from_secs(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_scales_linearly_between_bounds() {
        assert_eq!(conversion_timeout(Some(600.0)), Duration::from_secs(1200));
    }

    #[test]
    fn timeout_clamps_to_minimum() {
        assert_eq!(conversion_timeout(Some(10.0)), Duration::from_secs(120));
        assert_eq!(conversion_timeout(None), Duration::from_secs(120));
    }

    #[test]
    fn timeout_clamps_to_maximum() {
        assert_eq!(conversion_timeout(Some(36_000.0)), Duration::from_secs(1800));
    }
}
