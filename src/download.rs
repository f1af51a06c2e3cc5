use std::future::Future;
use std::path::{Path, PathBuf};

use tokio::time::Duration;
use tracing::{info, warn};

use crate::audio;
use crate::compat::{self, VerifyOutcome};
use crate::error::ApiError;
use crate::ffmpeg;
use crate::models::{DownloadRequest, DownloadType};
use crate::probe;
use crate::resolver::{self, CandidateStrategy};
use crate::tasks::{self, TaskMap};

const MERGE_TIMEOUT_SECONDS: u64 = 600;

/// Containers whose video bitstream muxes into mp4 without re-encoding.
const COPY_COMPATIBLE_EXTS: &[&str] = &["mp4", "m4v", "mov"];

#[derive(Debug)]
pub struct ChainSuccess {
    pub output: PathBuf,
    pub attempts: usize,
}

#[derive(Debug)]
pub struct ChainFailure {
    pub diagnostic: String,
    pub attempts: usize,
}

/// Tries candidates strictly in emitted order, short-circuiting on the first
/// success. A per-candidate failure advances the chain; only exhaustion of
/// every candidate surfaces as a failure, carrying the last diagnostic.
pub async fn drive_candidates<F, Fut>(
    candidates: &[CandidateStrategy],
    mut attempt: F,
) -> Result<ChainSuccess, ChainFailure>
where
    F: FnMut(usize, CandidateStrategy) -> Fut,
    Fut: Future<Output = Result<PathBuf, String>>,
{
    let mut last_diagnostic = "no candidate strategies were produced".to_string();

    for (index, candidate) in candidates.iter().enumerate() {
        match attempt(index, candidate.clone()).await {
            Ok(output) => {
                return Ok(ChainSuccess {
                    output,
                    attempts: index + 1,
                });
            }
            Err(diagnostic) => {
                warn!(
                    "Candidate {}/{} ({}) failed: {diagnostic}",
                    index + 1,
                    candidates.len(),
                    candidate.description
                );
                last_diagnostic = diagnostic;
            }
        }
    }

    Err(ChainFailure {
        diagnostic: last_diagnostic,
        attempts: candidates.len(),
    })
}

/// Entry point of one background download unit. Owns all writes to its task
/// id; any error ends up on the task record, never as a panic.
pub async fn run_download_task(
    tasks: TaskMap,
    task_id: String,
    work_dir: PathBuf,
    request: DownloadRequest,
) {
    if let Err(error) = execute(&tasks, &task_id, &work_dir, &request).await {
        tasks::mark_failed(&tasks, &task_id, error.message).await;
    }
}

async fn execute(
    tasks: &TaskMap,
    task_id: &str,
    work_dir: &Path,
    request: &DownloadRequest,
) -> Result<(), ApiError> {
    tasks::set_progress(tasks, task_id, 0.0, "Resolving available streams").await;

    let probed = probe::probe(&request.url).await?;
    let candidates =
        resolver::resolve_candidates(&request.format_id, request.download_type, &probed.formats)?;
    info!(
        "Task {task_id}: resolved {} candidate strategies for format '{}'",
        candidates.len(),
        request.format_id
    );

    let outcome = drive_candidates(&candidates, |_, candidate| {
        let url = request.url.clone();
        let tasks = tasks.clone();
        let task_id = task_id.to_string();
        let work_dir = work_dir.to_path_buf();
        async move {
            attempt_candidate(&tasks, &task_id, &work_dir, &url, &candidate)
                .await
                .map_err(|error| error.message)
        }
    })
    .await;

    let fetched = match outcome {
        Ok(success) => {
            info!(
                "Task {task_id}: succeeded on candidate {} of {}",
                success.attempts,
                candidates.len()
            );
            success.output
        }
        Err(failure) => {
            return Err(ApiError::bad_request(format!(
                "All {} download strategies failed: {}",
                failure.attempts, failure.diagnostic
            )));
        }
    };

    let final_path = match request.download_type {
        DownloadType::Video => {
            if let VerifyOutcome::Skipped(warning) = compat::verify_and_convert(&fetched).await {
                tasks::update(tasks, task_id, |state| state.warning = Some(warning)).await;
            }
            fetched
        }
        DownloadType::Audio => {
            tasks::mark_processing(tasks, task_id, 70.0, "Converting audio").await;
            let options = request.audio_options.clone().unwrap_or_default();
            let processed = audio::process_audio(&fetched, work_dir, &options).await?;
            if processed != fetched {
                let _ = tokio::fs::remove_file(&fetched).await;
            }
            processed
        }
    };

    tasks::mark_completed(tasks, task_id, final_path).await;
    Ok(())
}

async fn attempt_candidate(
    tasks: &TaskMap,
    task_id: &str,
    work_dir: &Path,
    url: &str,
    candidate: &CandidateStrategy,
) -> Result<PathBuf, ApiError> {
    if candidate.merge_needed
        && let Some((video_spec, audio_spec)) = candidate.format_spec.split_once('+')
    {
        return download_and_merge(tasks, task_id, work_dir, url, video_spec, audio_spec).await;
    }

    tasks::set_progress(tasks, task_id, 5.0, "Downloading stream").await;
    let fetched = probe::fetch_stream(url, &candidate.format_spec, work_dir, "stream").await?;
    tasks::set_progress(tasks, task_id, 70.0, "Stream downloaded").await;
    Ok(fetched)
}

/// Two-stream procedure: fetch video and audio separately, then mux them
/// into one progressive-streaming mp4. Raw streams are deleted whether the
/// mux succeeds or fails; a failure leaves no partial output behind.
async fn download_and_merge(
    tasks: &TaskMap,
    task_id: &str,
    work_dir: &Path,
    url: &str,
    video_spec: &str,
    audio_spec: &str,
) -> Result<PathBuf, ApiError> {
    tasks::set_progress(tasks, task_id, 5.0, "Downloading video stream").await;
    let video_path = probe::fetch_stream(url, video_spec, work_dir, "video").await?;
    tasks::set_progress(tasks, task_id, 10.0, "Video stream downloaded").await;

    let audio_path = match probe::fetch_stream(url, audio_spec, work_dir, "audio").await {
        Ok(path) => path,
        Err(error) => {
            let _ = tokio::fs::remove_file(&video_path).await;
            return Err(error);
        }
    };
    tasks::set_progress(tasks, task_id, 40.0, "Audio stream downloaded").await;

    tasks::mark_processing(tasks, task_id, 70.0, "Merging streams").await;
    let output = work_dir.join("merged.mp4");
    let result = mux_streams(&video_path, &audio_path, &output).await;

    let _ = tokio::fs::remove_file(&video_path).await;
    let _ = tokio::fs::remove_file(&audio_path).await;

    if let Err(error) = result {
        let _ = tokio::fs::remove_file(&output).await;
        return Err(error);
    }

    Ok(output)
}

async fn mux_streams(video: &Path, audio: &Path, output: &Path) -> Result<(), ApiError> {
    let video_ext = video
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    let mut args = vec![
        "-i".to_string(),
        video.to_string_lossy().to_string(),
        "-i".to_string(),
        audio.to_string_lossy().to_string(),
    ];

    if COPY_COMPATIBLE_EXTS.contains(&video_ext.as_str()) {
        args.push("-c:v".to_string());
        args.push("copy".to_string());
    } else {
        args.push("-c:v".to_string());
        args.push("libx264".to_string());
        args.push("-crf".to_string());
        args.push("23".to_string());
        args.push("-preset".to_string());
        args.push("fast".to_string());
    }

    // Audio is always transcoded at the mux step; bitstream copy across
    // container families is unreliable.
    args.push("-c:a".to_string());
    args.push("aac".to_string());
    args.push("-b:a".to_string());
    args.push("192k".to_string());
    args.push("-movflags".to_string());
    args.push("+faststart".to_string());
    args.push(output.to_string_lossy().to_string());

    ffmpeg::run_ffmpeg(&args, Duration::from_secs(MERGE_TIMEOUT_SECONDS)).await
}
