use std::io::ErrorKind;
use std::path::Path;

use tokio::process::Command;
use tokio::time::{Duration, timeout};
use tracing::warn;

use crate::error::ApiError;

/// Runs ffmpeg with the given arguments, bounded by `time_limit`.
///
/// A non-zero exit maps to a bad-request error carrying the last stderr
/// line as diagnostic; a timeout kills the process and is reported as such.
pub async fn run_ffmpeg(args: &[String], time_limit: Duration) -> Result<(), ApiError> {
    let mut command = Command::new("ffmpeg");
    command.arg("-hide_banner").arg("-y").args(args).kill_on_drop(true);

    let output = timeout(time_limit, command.output())
        .await
        .map_err(|_| ApiError::bad_request("Transcoding exceeded its time limit."))?
        .map_err(|error| spawn_error("ffmpeg", error))?;

    if !output.status.success() {
        let diagnostic = last_stderr_line(&output.stderr);
        warn!("ffmpeg exited with an error: {diagnostic}");
        return Err(ApiError::bad_request(format!(
            "Transcoding failed: {diagnostic}"
        )));
    }

    Ok(())
}

async fn run_ffprobe(args: &[String]) -> Result<String, ApiError> {
    let mut command = Command::new("ffprobe");
    command.arg("-v").arg("error").args(args).kill_on_drop(true);

    let output = timeout(Duration::from_secs(30), command.output())
        .await
        .map_err(|_| ApiError::bad_request("Probing exceeded its time limit."))?
        .map_err(|error| spawn_error("ffprobe", error))?;

    if !output.status.success() {
        let diagnostic = last_stderr_line(&output.stderr);
        return Err(ApiError::bad_request(format!("Probe failed: {diagnostic}")));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Duration of the media file in seconds, or `None` when it cannot be read.
pub async fn probe_duration(path: &Path) -> Option<f64> {
    let args = vec![
        "-show_entries".to_string(),
        "format=duration".to_string(),
        "-of".to_string(),
        "default=noprint_wrappers=1:nokey=1".to_string(),
        path.to_string_lossy().to_string(),
    ];

    match run_ffprobe(&args).await {
        Ok(value) => value.parse::<f64>().ok().filter(|d| *d > 0.0),
        Err(error) => {
            warn!("Could not probe duration of {:?}: {error}", path);
            None
        }
    }
}

/// Codec identifier of the primary video bitstream.
pub async fn probe_video_codec(path: &Path) -> Option<String> {
    let args = vec![
        "-select_streams".to_string(),
        "v:0".to_string(),
        "-show_entries".to_string(),
        "stream=codec_name".to_string(),
        "-of".to_string(),
        "default=noprint_wrappers=1:nokey=1".to_string(),
        path.to_string_lossy().to_string(),
    ];

    match run_ffprobe(&args).await {
        Ok(value) if !value.is_empty() => Some(value.lines().next().unwrap_or("").to_string()),
        Ok(_) => None,
        Err(error) => {
            warn!("Could not probe video codec of {:?}: {error}", path);
            None
        }
    }
}

fn spawn_error(binary: &str, error: std::io::Error) -> ApiError {
    if error.kind() == ErrorKind::NotFound {
        ApiError::internal(format!(
            "{binary} is not installed on this system. Install ffmpeg and restart the backend."
        ))
    } else {
        ApiError::internal(format!("Could not run {binary}: {error}"))
    }
}

fn last_stderr_line(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("no diagnostic output")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_line_is_extracted() {
        let stderr = b"frame= 100\nError while filtering\n\n";
        assert_eq!(last_stderr_line(stderr), "Error while filtering");
        assert_eq!(last_stderr_line(b""), "no diagnostic output");
    }
}
