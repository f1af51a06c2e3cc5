use std::collections::HashSet;
use std::path::{Path as FsPath, PathBuf};

use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use tokio_util::io::ReaderStream;
use tracing::info;
use url::Url;
use uuid::Uuid;

use crate::AppState;
use crate::audio::{self, AudioEditOptions};
use crate::download;
use crate::error::ApiError;
use crate::models::{
    AnalyzeRequest, AnalyzeResponse, AudioProcessRequest, CleanupResponse, DownloadRequest,
    FileQuery, FormatSummary, TaskAccepted, TaskStatusResponse, UploadResponse, format_filesize,
};
use crate::probe::{self, StreamDescriptor};
use crate::resolver;
use crate::tasks::{self, TaskMap, TaskPhase, TaskState};

const MAX_LISTED_FORMATS: usize = 10;

// ===================================================================
//                          ANALYZE
// ===================================================================

/// # POST /api/analyze - Probes a URL and lists its downloadable formats.
pub async fn analyze(Json(payload): Json<AnalyzeRequest>) -> Result<Json<AnalyzeResponse>, ApiError> {
    let url = validate_url(&payload.url)?;
    info!("Analyzing URL: {url}");

    let probed = probe::probe(&url).await?;
    let formats = build_format_summaries(&probed.formats);

    Ok(Json(AnalyzeResponse {
        title: probed.title,
        thumbnail: probed.thumbnail,
        duration: probed.duration,
        source: probed.source,
        formats,
    }))
}

/// Video formats ranked by the resolver's quality order and deduplicated by
/// displayed quality label, so each listed entry is the best carrier of its
/// label.
fn build_format_summaries(formats: &[StreamDescriptor]) -> Vec<FormatSummary> {
    let mut video: Vec<&StreamDescriptor> = formats
        .iter()
        .filter(|f| f.has_video() && f.height.is_some())
        .collect();
    video.sort_by(|a, b| resolver::compare_quality(a, b));

    let mut seen_labels = HashSet::new();
    video
        .into_iter()
        .filter(|f| seen_labels.insert(resolver::quality_label(f)))
        .take(MAX_LISTED_FORMATS)
        .map(|f| FormatSummary {
            format_id: f.id.clone(),
            quality: resolver::quality_label(f),
            resolution: f
                .height
                .map(|height| format!("{}x{height}", f.width.unwrap_or(0))),
            fps: f.fps,
            filesize: format_filesize(f.filesize),
            ext: f.ext.clone(),
            vcodec: f.vcodec.clone(),
            acodec: f.acodec.clone(),
            has_audio: f.has_audio(),
        })
        .collect()
}

// ===================================================================
//                          DOWNLOAD LIFECYCLE
// ===================================================================

/// # POST /api/download - Begins a background download task.
pub async fn start_download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> Result<(StatusCode, Json<TaskAccepted>), ApiError> {
    validate_url(&payload.url)?;
    if let Some(options) = &payload.audio_options {
        audio::validate_options(options)?;
    }

    let task_id = Uuid::new_v4().to_string();
    let task_dir = state.work_dir.join(&task_id);
    tokio::fs::create_dir_all(&task_dir)
        .await
        .map_err(|error| ApiError::internal(format!("Could not prepare work directory: {error}")))?;

    tasks::insert_new(&state.download_tasks, &task_id, task_dir.clone()).await;

    let tasks_map = state.download_tasks.clone();
    let semaphore = state.download_semaphore.clone();
    let id = task_id.clone();
    tokio::spawn(async move {
        let Ok(_permit) = semaphore.acquire_owned().await else {
            tasks::mark_failed(&tasks_map, &id, "Could not reserve download capacity.".to_string())
                .await;
            return;
        };
        download::run_download_task(tasks_map, id, task_dir, payload).await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(TaskAccepted {
            task_id,
            status: "started".to_string(),
        }),
    ))
}

/// # GET /api/download/status/{task_id}
pub async fn download_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskStatusResponse>, ApiError> {
    status_of(&state.download_tasks, &task_id, "/api/download/file").await
}

/// # GET /api/download/file/{task_id}
pub async fn download_file(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Query(query): Query<FileQuery>,
) -> Result<Response, ApiError> {
    serve_task_file(&state.download_tasks, &task_id, query.custom_filename.as_deref()).await
}

/// # DELETE /api/download/cleanup/{task_id}
pub async fn cleanup_download(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<CleanupResponse>, ApiError> {
    cleanup_task(&state.download_tasks, &task_id).await
}

// ===================================================================
//                          AUDIO LIFECYCLE
// ===================================================================

/// # POST /api/audio/upload - Accepts a multipart `file` field.
pub async fn upload_audio(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|error| ApiError::bad_request(format!("Invalid upload: {error}")))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let file_name = sanitize_ascii_filename(field.file_name().unwrap_or("upload.bin"));
        let data = field
            .bytes()
            .await
            .map_err(|error| ApiError::bad_request(format!("Could not read upload: {error}")))?;
        if data.is_empty() {
            return Err(ApiError::bad_request("Uploaded file is empty."));
        }

        let audio_id = Uuid::new_v4().to_string();
        let dir = state.upload_dir.join(&audio_id);
        tokio::fs::create_dir_all(&dir).await.map_err(|error| {
            ApiError::internal(format!("Could not prepare upload directory: {error}"))
        })?;

        let path = dir.join(&file_name);
        tokio::fs::write(&path, &data)
            .await
            .map_err(|error| ApiError::internal(format!("Could not store upload: {error}")))?;

        state.uploads.lock().await.insert(audio_id.clone(), path);
        info!("Stored upload {audio_id} ({} bytes)", data.len());

        return Ok(Json(UploadResponse { audio_id, file_name }));
    }

    Err(ApiError::bad_request("No 'file' field in the upload."))
}

/// # POST /api/audio/process - Begins a background processing task.
pub async fn process_audio(
    State(state): State<AppState>,
    Json(payload): Json<AudioProcessRequest>,
) -> Result<(StatusCode, Json<TaskAccepted>), ApiError> {
    let Some(input) = state.uploads.lock().await.get(&payload.audio_id).cloned() else {
        return Err(ApiError::not_found("Uploaded audio not found."));
    };
    audio::validate_options(&payload.options)?;

    let task_id = Uuid::new_v4().to_string();
    let task_dir = state.work_dir.join(&task_id);
    tokio::fs::create_dir_all(&task_dir)
        .await
        .map_err(|error| ApiError::internal(format!("Could not prepare work directory: {error}")))?;

    tasks::insert_new(&state.audio_tasks, &task_id, task_dir.clone()).await;

    let tasks_map = state.audio_tasks.clone();
    let semaphore = state.download_semaphore.clone();
    let id = task_id.clone();
    let options = payload.options;
    tokio::spawn(async move {
        let Ok(_permit) = semaphore.acquire_owned().await else {
            tasks::mark_failed(&tasks_map, &id, "Could not reserve processing capacity.".to_string())
                .await;
            return;
        };
        run_audio_task(tasks_map, id, input, task_dir, options).await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(TaskAccepted {
            task_id,
            status: "started".to_string(),
        }),
    ))
}

async fn run_audio_task(
    tasks: TaskMap,
    task_id: String,
    input: PathBuf,
    task_dir: PathBuf,
    options: AudioEditOptions,
) {
    tasks::mark_processing(&tasks, &task_id, 10.0, "Processing audio").await;

    match audio::process_audio(&input, &task_dir, &options).await {
        Ok(output) => tasks::mark_completed(&tasks, &task_id, output).await,
        Err(error) => tasks::mark_failed(&tasks, &task_id, error.message).await,
    }
}

/// # GET /api/audio/status/{task_id}
pub async fn audio_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskStatusResponse>, ApiError> {
    status_of(&state.audio_tasks, &task_id, "/api/audio/download").await
}

/// # GET /api/audio/download/{task_id}
pub async fn audio_download(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Query(query): Query<FileQuery>,
) -> Result<Response, ApiError> {
    serve_task_file(&state.audio_tasks, &task_id, query.custom_filename.as_deref()).await
}

/// # DELETE /api/audio/cleanup/{task_id}
pub async fn cleanup_audio(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<CleanupResponse>, ApiError> {
    cleanup_task(&state.audio_tasks, &task_id).await
}

// ===================================================================
//                          SHARED TASK HELPERS
// ===================================================================

async fn status_of(
    tasks: &TaskMap,
    task_id: &str,
    file_prefix: &str,
) -> Result<Json<TaskStatusResponse>, ApiError> {
    let Some(snapshot) = tasks::snapshot(tasks, task_id).await else {
        return Err(ApiError::not_found("Task not found."));
    };

    let ready = snapshot.status == TaskPhase::Completed;
    Ok(Json(TaskStatusResponse {
        ready,
        progress: snapshot.progress,
        status: snapshot.status.as_str().to_string(),
        message: snapshot.message,
        warning: snapshot.warning,
        download_url: ready.then(|| format!("{file_prefix}/{task_id}")),
        error: snapshot.error,
    }))
}

async fn serve_task_file(
    tasks: &TaskMap,
    task_id: &str,
    custom_filename: Option<&str>,
) -> Result<Response, ApiError> {
    let Some(snapshot) = tasks::snapshot(tasks, task_id).await else {
        return Err(ApiError::not_found("Task not found."));
    };
    stream_file_response(&snapshot, custom_filename).await
}

async fn stream_file_response(
    snapshot: &TaskState,
    custom_filename: Option<&str>,
) -> Result<Response, ApiError> {
    if snapshot.status != TaskPhase::Completed {
        return Err(ApiError::bad_request("Task is not finished yet."));
    }
    let Some(path) = &snapshot.file_path else {
        return Err(ApiError::internal("Task record has no output file."));
    };

    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|error| ApiError::internal(format!("Could not read output file: {error}")))?;

    let actual_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("download.bin");
    let filename = effective_filename(actual_name, custom_filename);

    let file = tokio::fs::File::open(path)
        .await
        .map_err(|error| ApiError::internal(format!("Could not open output file: {error}")))?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(&filename)),
    );
    headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&metadata.len().to_string())
            .map_err(|_| ApiError::internal("Could not build the length header."))?,
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| ApiError::internal("Could not build the download header."))?,
    );

    Ok((headers, body).into_response())
}

async fn cleanup_task(tasks: &TaskMap, task_id: &str) -> Result<Json<CleanupResponse>, ApiError> {
    let Some(removed) = tasks::remove(tasks, task_id).await else {
        return Err(ApiError::not_found("Task not found."));
    };

    if let Some(dir) = removed.work_dir {
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    Ok(Json(CleanupResponse {
        status: "cleaned".to_string(),
    }))
}

// ===================================================================
//                          HELPERS
// ===================================================================

fn validate_url(input: &str) -> Result<String, ApiError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ApiError::bad_request("Enter a valid URL."));
    }

    let parsed =
        Url::parse(trimmed).map_err(|_| ApiError::bad_request("Enter a valid URL."))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(ApiError::bad_request("Only http and https URLs are supported."));
    }

    Ok(trimmed.to_string())
}

/// The served filename: a non-empty custom name wins, inheriting the real
/// extension when it does not carry one of its own.
fn effective_filename(actual: &str, custom: Option<&str>) -> String {
    let Some(custom) = custom.map(str::trim).filter(|name| !name.is_empty()) else {
        return actual.to_string();
    };

    if FsPath::new(custom).extension().is_some() {
        return custom.to_string();
    }

    match FsPath::new(actual).extension().and_then(|ext| ext.to_str()) {
        Some(ext) => format!("{custom}.{ext}"),
        None => custom.to_string(),
    }
}

fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = FsPath::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "opus" => "audio/ogg",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let mut sanitized = String::with_capacity(value.len());

    for character in value.chars() {
        if character.is_ascii_alphanumeric()
            || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
        {
            sanitized.push(character);
        } else {
            sanitized.push('_');
        }
    }

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_validation() {
        assert!(validate_url("https://example.com/watch?v=1").is_ok());
        assert!(validate_url("  https://example.com  ").is_ok());
        assert!(validate_url("").is_err());
        assert!(validate_url("ftp://example.com/file").is_err());
        assert!(validate_url("not a url").is_err());
    }

    #[test]
    fn custom_filename_inherits_extension() {
        assert_eq!(effective_filename("merged.mp4", None), "merged.mp4");
        assert_eq!(effective_filename("merged.mp4", Some("holiday")), "holiday.mp4");
        assert_eq!(
            effective_filename("merged.mp4", Some("holiday.mkv")),
            "holiday.mkv"
        );
        assert_eq!(effective_filename("merged.mp4", Some("  ")), "merged.mp4");
    }

    #[test]
    fn filenames_are_sanitized_for_ascii_headers() {
        assert_eq!(sanitize_ascii_filename("my/video:2024.mp4"), "my_video_2024.mp4");
        assert_eq!(sanitize_ascii_filename("????"), "____");
        assert_eq!(sanitize_ascii_filename(""), "download.bin");
    }

    #[test]
    fn content_types_by_extension() {
        assert_eq!(content_type_for_filename("a.mp4"), "video/mp4");
        assert_eq!(content_type_for_filename("a.MP3"), "audio/mpeg");
        assert_eq!(content_type_for_filename("a.xyz"), "application/octet-stream");
    }
}
