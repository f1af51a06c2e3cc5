use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::process::Command;
use tokio::time::{Duration, timeout};
use tracing::warn;

use crate::error::ApiError;

const PROBE_TIMEOUT_SECONDS: u64 = 60;
const FETCH_TIMEOUT_SECONDS: u64 = 300;

/// One fetchable encoding exposed by the source, as reported by the probe.
#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    pub id: String,
    pub ext: String,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub height: Option<u32>,
    pub width: Option<u32>,
    pub fps: Option<f32>,
    pub tbr: Option<f32>,
    pub abr: Option<f32>,
    pub filesize: Option<f64>,
}

impl StreamDescriptor {
    pub fn has_video(&self) -> bool {
        self.vcodec.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.acodec.is_some()
    }

    pub fn is_premuxed(&self) -> bool {
        self.has_video() && self.has_audio()
    }

    pub fn is_audio_only(&self) -> bool {
        self.has_audio() && !self.has_video()
    }
}

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub title: String,
    pub thumbnail: Option<String>,
    pub duration: Option<f64>,
    pub source: String,
    pub formats: Vec<StreamDescriptor>,
}

#[derive(Debug, Deserialize)]
struct YtDlpVideoInfo {
    title: Option<String>,
    thumbnail: Option<String>,
    duration: Option<f64>,
    extractor_key: Option<String>,
    #[serde(default)]
    formats: Vec<YtDlpFormat>,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    format_id: String,
    ext: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    height: Option<u32>,
    width: Option<u32>,
    fps: Option<f32>,
    tbr: Option<f32>,
    abr: Option<f32>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
}

fn codec_or_none(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty() && v != "none")
}

impl From<YtDlpFormat> for StreamDescriptor {
    fn from(raw: YtDlpFormat) -> Self {
        StreamDescriptor {
            id: raw.format_id,
            ext: raw.ext.unwrap_or_else(|| "mp4".to_string()),
            vcodec: codec_or_none(raw.vcodec),
            acodec: codec_or_none(raw.acodec),
            height: raw.height,
            width: raw.width,
            fps: raw.fps,
            tbr: raw.tbr,
            abr: raw.abr,
            filesize: raw.filesize.or(raw.filesize_approx),
        }
    }
}

/// Resolves a URL into the list of available stream descriptors.
pub async fn probe(url: &str) -> Result<ProbeResult, ApiError> {
    let output = run_yt_dlp(
        vec![
            "-J".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            url.to_string(),
        ],
        Duration::from_secs(PROBE_TIMEOUT_SECONDS),
    )
    .await?;

    let info: YtDlpVideoInfo = serde_json::from_slice(&output.stdout)
        .map_err(|error| ApiError::bad_request(format!("Could not read source metadata: {error}")))?;

    Ok(ProbeResult {
        title: info
            .title
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "Unknown".to_string()),
        thumbnail: info.thumbnail,
        duration: info.duration,
        source: info.extractor_key.unwrap_or_else(|| "Unknown".to_string()),
        formats: info.formats.into_iter().map(StreamDescriptor::from).collect(),
    })
}

/// Downloads one raw stream into `dir`, preserving the source-reported
/// extension, and returns the path of the fetched file.
pub async fn fetch_stream(
    url: &str,
    format_spec: &str,
    dir: &Path,
    stem: &str,
) -> Result<PathBuf, ApiError> {
    let output_template = format!("{}/{stem}.%(ext)s", dir.to_string_lossy());

    run_yt_dlp(
        vec![
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "-f".to_string(),
            format_spec.to_string(),
            "-o".to_string(),
            output_template,
            url.to_string(),
        ],
        Duration::from_secs(FETCH_TIMEOUT_SECONDS),
    )
    .await?;

    resolve_fetched_file(dir, stem).await
}

async fn resolve_fetched_file(dir: &Path, stem: &str) -> Result<PathBuf, ApiError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|error| ApiError::internal(format!("Could not open work directory: {error}")))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|error| ApiError::internal(format!("Could not list work directory: {error}")))?
    {
        let path = entry.path();
        let matches_stem = path
            .file_stem()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name == stem);
        if matches_stem && path.is_file() {
            return Ok(path);
        }
    }

    Err(ApiError::internal(format!(
        "Fetched stream '{stem}' was not found on disk."
    )))
}

async fn run_yt_dlp(
    args: Vec<String>,
    time_limit: Duration,
) -> Result<std::process::Output, ApiError> {
    let mut command = Command::new("yt-dlp");
    command.args(args).kill_on_drop(true);

    let output = timeout(time_limit, command.output())
        .await
        .map_err(|_| ApiError::bad_request("The operation exceeded its time limit."))?
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                ApiError::internal(
                    "yt-dlp is not installed on this system. Install yt-dlp and restart the backend.",
                )
            } else {
                ApiError::internal(format!("Could not run yt-dlp: {error}"))
            }
        })?;

    if !output.status.success() {
        let message = run_error_message(&output.stderr);
        warn!("yt-dlp exited with an error: {message}");
        return Err(ApiError::bad_request(message));
    }

    Ok(output)
}

fn run_error_message(stderr: &[u8]) -> String {
    let message = String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp could not complete the operation")
        .to_string();

    if message.to_ascii_lowercase().contains("unsupported url") {
        "Unsupported or invalid URL.".to_string()
    } else {
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_none_maps_to_absent() {
        assert_eq!(codec_or_none(Some("none".to_string())), None);
        assert_eq!(codec_or_none(Some(String::new())), None);
        assert_eq!(
            codec_or_none(Some("avc1.640028".to_string())),
            Some("avc1.640028".to_string())
        );
        assert_eq!(codec_or_none(None), None);
    }

    #[test]
    fn descriptor_flags() {
        let raw = YtDlpFormat {
            format_id: "137".to_string(),
            ext: Some("mp4".to_string()),
            vcodec: Some("avc1".to_string()),
            acodec: Some("none".to_string()),
            height: Some(1080),
            width: Some(1920),
            fps: Some(30.0),
            tbr: Some(4500.0),
            abr: None,
            filesize: None,
            filesize_approx: Some(1000.0),
        };
        let descriptor = StreamDescriptor::from(raw);
        assert!(descriptor.has_video());
        assert!(!descriptor.has_audio());
        assert!(!descriptor.is_premuxed());
        assert_eq!(descriptor.filesize, Some(1000.0));
    }

    #[test]
    fn stderr_last_line_wins() {
        let stderr = b"WARNING: something\nERROR: video unavailable\n";
        assert_eq!(run_error_message(stderr), "ERROR: video unavailable");
    }

    #[test]
    fn unsupported_url_is_rewritten() {
        let stderr = b"ERROR: Unsupported URL: ftp://example.com\n";
        assert_eq!(run_error_message(stderr), "Unsupported or invalid URL.");
    }
}
