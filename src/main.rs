use std::{
    collections::{HashMap, HashSet},
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use axum::{
    Json, Router,
    extract::DefaultBodyLimit,
    http::{
        HeaderValue, Method,
        header::{AUTHORIZATION, CONTENT_DISPOSITION, CONTENT_TYPE},
    },
    middleware,
    routing::{delete, get, post},
};
use tokio::{
    net::TcpListener,
    sync::{Mutex, Semaphore},
    time::Duration,
};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;

mod audio;
mod auth;
mod auth_handlers;
mod compat;
mod download;
mod error;
mod ffmpeg;
mod handlers;
mod models;
mod probe;
mod resolver;
mod tasks;

use crate::auth::AuthStore;
use crate::error::ApiError;
use crate::tasks::TaskMap;

const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
const STALE_ARTIFACT_SECONDS: u64 = 2 * 60 * 60;
const MAX_UPLOAD_BYTES: usize = 250 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthStore>,
    pub download_tasks: TaskMap,
    pub audio_tasks: TaskMap,
    pub uploads: Arc<Mutex<HashMap<String, PathBuf>>>,
    pub download_semaphore: Arc<Semaphore>,
    pub work_dir: PathBuf,
    pub upload_dir: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "dlvideo_backend=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let data_dir = std::env::var("DLVIDEO_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("data"));
    let work_dir = data_dir.join("work");
    let upload_dir = data_dir.join("uploads");

    for dir in [&data_dir, &work_dir, &upload_dir] {
        tokio::fs::create_dir_all(dir).await.map_err(|error| {
            ApiError::internal(format!("Could not create data directory: {error}"))
        })?;
    }

    // Bound disk usage left behind by interrupted prior runs.
    cleanup_stale_artifacts(&work_dir, STALE_ARTIFACT_SECONDS).await;
    cleanup_stale_artifacts(&upload_dir, STALE_ARTIFACT_SECONDS).await;

    let auth = AuthStore::load(data_dir.join("users.json")).await?;
    let max_concurrent_downloads = read_usize_env("MAX_CONCURRENT_DOWNLOADS")
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_MAX_CONCURRENT_DOWNLOADS);

    let state = AppState {
        auth: Arc::new(auth),
        download_tasks: tasks::new_task_map(),
        audio_tasks: tasks::new_task_map(),
        uploads: Arc::new(Mutex::new(HashMap::new())),
        download_semaphore: Arc::new(Semaphore::new(max_concurrent_downloads)),
        work_dir,
        upload_dir,
    };

    let cors = build_cors_layer()?;

    let protected = Router::new()
        .route("/api/analyze", post(handlers::analyze))
        .route("/api/download", post(handlers::start_download))
        .route("/api/download/status/{task_id}", get(handlers::download_status))
        .route("/api/download/file/{task_id}", get(handlers::download_file))
        .route(
            "/api/download/cleanup/{task_id}",
            delete(handlers::cleanup_download),
        )
        .route(
            "/api/audio/upload",
            post(handlers::upload_audio).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/api/audio/process", post(handlers::process_audio))
        .route("/api/audio/status/{task_id}", get(handlers::audio_status))
        .route("/api/audio/download/{task_id}", get(handlers::audio_download))
        .route("/api/audio/cleanup/{task_id}", delete(handlers::cleanup_audio))
        .route("/api/auth/logout", post(auth_handlers::logout))
        .route("/api/auth/change-password", post(auth_handlers::change_password))
        .route("/api/auth/me", get(auth_handlers::me))
        .route(
            "/api/auth/users",
            post(auth_handlers::create_user).get(auth_handlers::list_users),
        )
        .route("/api/auth/users/{username}", delete(auth_handlers::delete_user))
        .route("/api/auth/reset-password", post(auth_handlers::reset_password))
        .route("/api/auth/update-username", post(auth_handlers::update_username))
        .route("/api/auth/sessions", get(auth_handlers::list_sessions))
        .route(
            "/api/auth/sessions/{username}",
            delete(auth_handlers::delete_user_sessions),
        )
        .route("/api/auth/cleanup-sessions", post(auth_handlers::cleanup_sessions))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_handlers::require_session,
        ));

    let app = Router::new()
        .route("/api/health", get(health))
        .route("/api/auth/login", post(auth_handlers::login))
        .route("/api/auth/verify", get(auth_handlers::verify))
        .merge(protected)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = resolve_bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|error| ApiError::internal(format!("Could not bind to {addr}: {error}")))?;

    info!("Backend ready at http://{addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

fn read_usize_env(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
    {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    "127.0.0.1:8787".to_string()
}

fn build_cors_layer() -> Result<CorsLayer, ApiError> {
    let configured = std::env::var("ALLOWED_ORIGINS")
        .ok()
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let origins = if configured.is_empty() {
        warn!("ALLOWED_ORIGINS is not set. Using default development origins.");
        vec![
            "http://127.0.0.1:5173".to_string(),
            "http://localhost:5173".to_string(),
        ]
    } else {
        configured
    };

    let normalized_origins = origins
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://domain.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    let allowed_origins = Arc::new(normalized_origins);
    let allow_origin = AllowOrigin::predicate({
        let allowed_origins = Arc::clone(&allowed_origins);
        move |origin: &HeaderValue, _| {
            let normalized = origin.to_str().ok().and_then(normalize_origin);
            let allowed = normalized
                .as_ref()
                .is_some_and(|value| allowed_origins.contains(value));
            debug!(
                "CORS origin check raw={:?} normalized={:?} allowed={}",
                origin, normalized, allowed
            );
            allowed
        }
    });

    info!("CORS allow-list loaded with {} origin(s)", allowed_origins.len());

    // Cookie-based sessions need credentialed CORS, which rules out
    // wildcard origins and headers.
    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .allow_credentials(true)
        .expose_headers([CONTENT_DISPOSITION]))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };
    let port = parsed.port();

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    let include_port = port.is_some_and(|explicit| explicit != default_port);

    if include_port {
        Some(format!("{scheme}://{host}:{}", port?))
    } else {
        Some(format!("{scheme}://{host}"))
    }
}

/// Removes entries in `dir` whose last modification is older than
/// `older_than_secs`, recursively for directories.
async fn cleanup_stale_artifacts(dir: &Path, older_than_secs: u64) {
    if older_than_secs == 0 {
        return;
    }

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("Could not open {:?} for cleanup: {error}", dir);
            }
            return;
        }
    };

    let max_age = Duration::from_secs(older_than_secs);
    let now = std::time::SystemTime::now();

    loop {
        let maybe_entry = match entries.next_entry().await {
            Ok(value) => value,
            Err(error) => {
                warn!("Could not iterate {:?} for cleanup: {error}", dir);
                break;
            }
        };

        let Some(entry) = maybe_entry else {
            break;
        };

        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!("Could not read metadata of {:?}: {error}", path);
                continue;
            }
        };

        let modified_at = match metadata.modified() {
            Ok(value) => value,
            Err(error) => {
                warn!("Could not read modification time of {:?}: {error}", path);
                continue;
            }
        };

        let age = now
            .duration_since(modified_at)
            .unwrap_or(Duration::from_secs(0));
        if age < max_age {
            continue;
        }

        if metadata.is_dir() {
            if let Err(error) = tokio::fs::remove_dir_all(&path).await
                && error.kind() != ErrorKind::NotFound
            {
                warn!("Could not remove stale directory {:?}: {error}", path);
            }
        } else if metadata.is_file()
            && let Err(error) = tokio::fs::remove_file(&path).await
            && error.kind() != ErrorKind::NotFound
        {
            warn!("Could not remove stale file {:?}: {error}", path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origins_normalize_to_scheme_host() {
        assert_eq!(
            normalize_origin("https://Example.com"),
            Some("https://example.com".to_string())
        );
        assert_eq!(
            normalize_origin("http://localhost:5173"),
            Some("http://localhost:5173".to_string())
        );
        // Default ports collapse away.
        assert_eq!(
            normalize_origin("https://example.com:443"),
            Some("https://example.com".to_string())
        );
        assert_eq!(normalize_origin("https://example.com/path"), None);
        assert_eq!(normalize_origin("ftp://example.com"), None);
    }
}
