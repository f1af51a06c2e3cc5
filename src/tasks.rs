use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

/// Lifecycle phases of one background task.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskPhase {
    Starting,
    Downloading,
    Processing,
    Completed,
    Failed,
}

impl TaskPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskPhase::Starting => "starting",
            TaskPhase::Downloading => "downloading",
            TaskPhase::Processing => "processing",
            TaskPhase::Completed => "completed",
            TaskPhase::Failed => "failed",
        }
    }
}

/// Progress record for one task id. Written only by the background unit that
/// owns the id; read by any number of concurrent status polls.
#[derive(Debug, Clone, Serialize)]
pub struct TaskState {
    pub progress: f32,
    pub status: TaskPhase,
    pub message: String,
    pub file_name: Option<String>,
    pub warning: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub file_path: Option<PathBuf>,
    #[serde(skip)]
    pub work_dir: Option<PathBuf>,
}

pub type TaskMap = Arc<Mutex<HashMap<String, TaskState>>>;

pub fn new_task_map() -> TaskMap {
    Arc::new(Mutex::new(HashMap::new()))
}

pub async fn insert_new(tasks: &TaskMap, task_id: &str, work_dir: PathBuf) {
    tasks.lock().await.insert(
        task_id.to_string(),
        TaskState {
            progress: 0.0,
            status: TaskPhase::Starting,
            message: "Task queued".to_string(),
            file_name: None,
            warning: None,
            error: None,
            created_at: Utc::now(),
            file_path: None,
            work_dir: Some(work_dir),
        },
    );
}

pub async fn update<F>(tasks: &TaskMap, task_id: &str, apply: F)
where
    F: FnOnce(&mut TaskState),
{
    if let Some(state) = tasks.lock().await.get_mut(task_id) {
        apply(state);
    }
}

pub async fn set_progress(tasks: &TaskMap, task_id: &str, progress: f32, message: &str) {
    update(tasks, task_id, |state| {
        state.progress = progress;
        state.status = if progress < 100.0 {
            TaskPhase::Downloading
        } else {
            TaskPhase::Completed
        };
        state.message = message.to_string();
    })
    .await;
}

pub async fn mark_processing(tasks: &TaskMap, task_id: &str, progress: f32, message: &str) {
    update(tasks, task_id, |state| {
        state.progress = progress;
        state.status = TaskPhase::Processing;
        state.message = message.to_string();
    })
    .await;
}

pub async fn mark_completed(tasks: &TaskMap, task_id: &str, file_path: PathBuf) {
    update(tasks, task_id, |state| {
        state.progress = 100.0;
        state.status = TaskPhase::Completed;
        state.message = "Completed".to_string();
        state.file_name = file_path
            .file_name()
            .and_then(|name| name.to_str())
            .map(ToString::to_string);
        state.file_path = Some(file_path);
    })
    .await;
}

pub async fn mark_failed(tasks: &TaskMap, task_id: &str, error: String) {
    update(tasks, task_id, |state| {
        state.status = TaskPhase::Failed;
        state.message = "Failed".to_string();
        state.error = Some(error);
    })
    .await;
}

pub async fn snapshot(tasks: &TaskMap, task_id: &str) -> Option<TaskState> {
    tasks.lock().await.get(task_id).cloned()
}

pub async fn remove(tasks: &TaskMap, task_id: &str) -> Option<TaskState> {
    tasks.lock().await.remove(task_id)
}
