use std::net::SocketAddr;

use axum::{
    Extension, Json,
    extract::{ConnectInfo, Path, Request, State},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{AUTHORIZATION, COOKIE, SET_COOKIE},
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::AppState;
use crate::auth::{Role, SESSION_EXPIRY_HOURS, SessionSummary, UserSummary};
use crate::error::ApiError;

const SESSION_COOKIE_NAME: &str = "session_token";

/// Authenticated identity attached to the request by the middleware.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub username: String,
    pub role: Role,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub success: bool,
    pub session_token: String,
    pub username: String,
    pub role: Role,
    pub must_change_password: bool,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
    pub role: Role,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub username: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateUsernameRequest {
    pub old_username: String,
    pub new_username: String,
}

// ===================================================================
//                          MIDDLEWARE
// ===================================================================

/// Rejects requests without a valid session and attaches the verified
/// identity to the request for downstream handlers.
pub async fn require_session(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(token) = extract_session_token(request.headers()) else {
        return Err(ApiError::unauthorized("Not authenticated. Please login first."));
    };

    let Some(session) = state.auth.verify_session(&token).await else {
        return Err(ApiError::unauthorized(
            "Invalid or expired session. Please login again.",
        ));
    };

    request.extensions_mut().insert(AuthContext {
        username: session.username,
        role: session.role,
        token,
        expires_at: session.expires_at,
    });

    Ok(next.run(request).await)
}

/// Authenticated but insufficient role is a distinct failure from
/// unauthenticated.
fn require_admin(context: &AuthContext) -> Result<(), ApiError> {
    if context.role != Role::Admin {
        return Err(ApiError::forbidden("Access denied. Required role: admin"));
    }
    Ok(())
}

fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok())
        && let Some(token) = value.strip_prefix("Bearer ")
    {
        let token = token.trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }

    headers
        .get(COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|cookies| {
            cookies
                .split(';')
                .map(str::trim)
                .find_map(|cookie| cookie.strip_prefix("session_token="))
        })
        .filter(|token| !token.is_empty())
        .map(ToString::to_string)
}

fn session_cookie(token: &str, max_age_seconds: i64) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(&format!(
        "{SESSION_COOKIE_NAME}={token}; HttpOnly; SameSite=Lax; Path=/; Max-Age={max_age_seconds}"
    ))
    .map_err(|_| ApiError::internal("Could not build the session cookie."))
}

fn expired_cookie() -> Result<HeaderValue, ApiError> {
    session_cookie("", 0)
}

// ===================================================================
//                          PUBLIC ENDPOINTS
// ===================================================================

/// # POST /api/auth/login - The token is returned in the body and set as an
/// HTTP-only cookie.
pub async fn login(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<LoginRequest>,
) -> Result<Response, ApiError> {
    let grant = state
        .auth
        .login(&payload.username, &payload.password, Some(addr.ip().to_string()))
        .await?;

    let cookie = session_cookie(&grant.token, SESSION_EXPIRY_HOURS * 3600)?;
    let body = Json(LoginResponse {
        success: true,
        session_token: grant.token,
        username: grant.username,
        role: grant.role,
        must_change_password: grant.must_change_password,
        expires_at: grant.expires_at,
    });

    let mut response = (StatusCode::OK, body).into_response();
    response.headers_mut().insert(SET_COOKIE, cookie);
    Ok(response)
}

/// # GET /api/auth/verify - Public; reports whether the presented token is
/// still valid.
pub async fn verify(State(state): State<AppState>, headers: HeaderMap) -> Json<VerifyResponse> {
    let session = match extract_session_token(&headers) {
        Some(token) => state.auth.verify_session(&token).await,
        None => None,
    };

    Json(match session {
        Some(session) => VerifyResponse {
            authenticated: true,
            username: Some(session.username),
            role: Some(session.role),
            expires_at: Some(session.expires_at),
        },
        None => VerifyResponse {
            authenticated: false,
            username: None,
            role: None,
            expires_at: None,
        },
    })
}

// ===================================================================
//                          PROTECTED ENDPOINTS
// ===================================================================

/// # POST /api/auth/logout
pub async fn logout(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Result<Response, ApiError> {
    let removed = state.auth.logout(&context.token).await;

    let body = Json(json!({
        "success": removed,
        "message": if removed { "Logged out successfully" } else { "No active session" },
    }));
    let mut response = (StatusCode::OK, body).into_response();
    response.headers_mut().insert(SET_COOKIE, expired_cookie()?);
    Ok(response)
}

/// # POST /api/auth/change-password
pub async fn change_password(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .auth
        .change_password(&context.username, &payload.old_password, &payload.new_password)
        .await?;

    Ok(Json(json!({
        "success": true,
        "message": "Password changed successfully",
    })))
}

/// # GET /api/auth/me
pub async fn me(Extension(context): Extension<AuthContext>) -> Json<serde_json::Value> {
    Json(json!({
        "username": context.username,
        "role": context.role,
        "expires_at": context.expires_at,
    }))
}

// ===================================================================
//                          ADMIN ENDPOINTS
// ===================================================================

/// # POST /api/auth/users - Admin only.
pub async fn create_user(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<CreateUserRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_admin(&context)?;
    info!(
        "Admin '{}' creating user '{}'",
        context.username, payload.username
    );

    state
        .auth
        .create_user(&payload.username, &payload.password, payload.role)
        .await?;

    Ok(Json(json!({
        "success": true,
        "username": payload.username,
        "role": payload.role,
    })))
}

/// # GET /api/auth/users - Admin only.
pub async fn list_users(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Result<Json<Vec<UserSummary>>, ApiError> {
    require_admin(&context)?;
    Ok(Json(state.auth.list_users().await))
}

/// # DELETE /api/auth/users/{username} - Admin only.
pub async fn delete_user(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(username): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_admin(&context)?;
    state.auth.delete_user(&username, &context.username).await?;

    Ok(Json(json!({
        "success": true,
        "message": format!("User '{username}' deleted successfully"),
    })))
}

/// # POST /api/auth/reset-password - Admin only. A self-reset preserves the
/// session used to make this very request.
pub async fn reset_password(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<ResetPasswordRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_admin(&context)?;
    state
        .auth
        .reset_password(
            &payload.username,
            &payload.new_password,
            &context.username,
            Some(&context.token),
        )
        .await?;

    Ok(Json(json!({
        "success": true,
        "message": "Password reset successfully",
    })))
}

/// # POST /api/auth/update-username - Admin only.
pub async fn update_username(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<UpdateUsernameRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_admin(&context)?;
    state
        .auth
        .rename_user(&payload.old_username, &payload.new_username, &context.username)
        .await?;

    Ok(Json(json!({
        "success": true,
        "message": format!(
            "Username changed from '{}' to '{}'",
            payload.old_username, payload.new_username
        ),
    })))
}

/// # GET /api/auth/sessions - Admin only.
pub async fn list_sessions(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_admin(&context)?;
    let sessions: Vec<SessionSummary> = state.auth.list_sessions().await;

    Ok(Json(json!({
        "active_sessions": sessions.len(),
        "sessions": sessions,
    })))
}

/// # DELETE /api/auth/sessions/{username} - Admin only.
pub async fn delete_user_sessions(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(username): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_admin(&context)?;
    let removed = state.auth.delete_user_sessions(&username).await?;

    Ok(Json(json!({
        "success": true,
        "message": format!("Deleted {removed} sessions for user '{username}'"),
    })))
}

/// # POST /api/auth/cleanup-sessions - Admin only.
pub async fn cleanup_sessions(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_admin(&context)?;
    let removed = state.auth.cleanup_expired_sessions().await?;

    Ok(Json(json!({
        "success": true,
        "cleaned_sessions": removed,
    })))
}
