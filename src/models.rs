use serde::{Deserialize, Serialize};

use crate::audio::AudioEditOptions;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DownloadType {
    Video,
    Audio,
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct AnalyzeResponse {
    pub title: String,
    pub thumbnail: Option<String>,
    pub duration: Option<f64>,
    pub source: String,
    pub formats: Vec<FormatSummary>,
}

/// One selectable encoding as shown to the client.
#[derive(Debug, Serialize)]
pub struct FormatSummary {
    pub format_id: String,
    pub quality: String,
    pub resolution: Option<String>,
    pub fps: Option<f32>,
    pub filesize: String,
    pub ext: String,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub has_audio: bool,
}

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    pub format_id: String,
    pub download_type: DownloadType,
    #[serde(default)]
    pub audio_options: Option<AudioEditOptions>,
}

#[derive(Debug, Serialize)]
pub struct TaskAccepted {
    pub task_id: String,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct TaskStatusResponse {
    pub ready: bool,
    pub progress: f32,
    pub status: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub audio_id: String,
    pub file_name: String,
}

#[derive(Debug, Deserialize)]
pub struct AudioProcessRequest {
    pub audio_id: String,
    #[serde(default)]
    pub options: AudioEditOptions,
}

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    pub custom_filename: Option<String>,
}

pub fn format_filesize(bytes: Option<f64>) -> String {
    let Some(mut size) = bytes else {
        return "Unknown".to_string();
    };
    if size <= 0.0 {
        return "Unknown".to_string();
    }

    for unit in ["B", "KB", "MB", "GB"] {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} TB")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filesize_labels() {
        assert_eq!(format_filesize(None), "Unknown");
        assert_eq!(format_filesize(Some(0.0)), "Unknown");
        assert_eq!(format_filesize(Some(512.0)), "512.0 B");
        assert_eq!(format_filesize(Some(10.0 * 1024.0 * 1024.0)), "10.0 MB");
        assert_eq!(
            format_filesize(Some(3.0 * 1024.0 * 1024.0 * 1024.0)),
            "3.0 GB"
        );
    }
}
