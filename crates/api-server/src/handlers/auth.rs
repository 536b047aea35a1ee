//! Authentication handlers for registration, login, and logout.

use auth::{hash_password, issue_unique_key, validate_password_strength, verify_password};
use auth::{AuditAction, AuditEvent};
use axum::extract::State;
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use relay_core::types::User;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// User registration request.
#[derive(Debug, Deserialize, ToSchema)]
pub struct RegisterRequest {
    /// Email address (case-insensitive unique).
    pub email: String,
    /// Display username (exact unique).
    pub username: String,
    /// Password.
    pub password: String,
}

/// User login request.
#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginRequest {
    /// Email address.
    pub email: String,
    /// Password.
    pub password: String,
}

/// Authentication response with token and user info.
#[derive(Debug, Serialize, ToSchema)]
pub struct AuthResponse {
    /// Bearer session token.
    pub token: String,
    /// User information.
    pub user: UserInfo,
}

/// User information.
#[derive(Debug, Serialize, ToSchema)]
pub struct UserInfo {
    /// User ID.
    pub id: i64,
    /// Email address.
    pub email: String,
    /// Username.
    pub username: String,
    /// Whether others may copy this user's trades.
    pub is_master_trader: bool,
    /// Ingestion API key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Account creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl From<User> for UserInfo {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            username: user.username,
            is_master_trader: user.is_master_trader,
            api_key: user.api_key,
            created_at: user.created_at,
        }
    }
}

/// Register a new user account.
#[utoipa::path(
    post,
    path = "/api/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "User registered successfully", body = AuthResponse),
        (status = 400, description = "Weak password or duplicate email/username"),
    ),
    tag = "auth"
)]
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<AuthResponse>)> {
    if !req.email.contains('@') || req.email.len() < 5 {
        return Err(ApiError::BadRequest("Invalid email address".into()));
    }
    if req.username.trim().is_empty() || req.username.len() > 50 {
        return Err(ApiError::BadRequest("Invalid username".into()));
    }
    validate_password_strength(&req.password).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    if state.users.find_by_email(&req.email).await?.is_some() {
        return Err(ApiError::Conflict("Email already registered".into()));
    }
    if state.users.find_by_username(&req.username).await?.is_some() {
        return Err(ApiError::Conflict("Username already taken".into()));
    }

    let password_hash = hash_password(&req.password).map_err(ApiError::Internal)?;
    let user = state
        .users
        .create(&req.email, &req.username, &password_hash)
        .await?;

    // Second phase: generate the api key now that the real user id exists.
    let api_key = issue_unique_key(&state.users, user.id).await?;

    state.audit.log(
        AuditEvent::new(AuditAction::Registered, format!("user/{}", user.id)).user(user.id),
    );

    let token = state.sessions.issue(user.id);
    state.users.record_login(user.id).await?;

    let mut info = UserInfo::from(user);
    info.api_key = Some(api_key);

    Ok((
        StatusCode::CREATED,
        Json(AuthResponse { token, user: info }),
    ))
}

/// Login with email and password.
#[utoipa::path(
    post,
    path = "/api/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = AuthResponse),
        (status = 401, description = "Invalid credentials"),
    ),
    tag = "auth"
)]
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<AuthResponse>> {
    let user = match state.users.find_by_email(&req.email).await? {
        Some(user) => user,
        None => {
            state.audit.log(AuditEvent::new(
                AuditAction::LoginFailed,
                format!("unknown email {}", req.email),
            ));
            return Err(ApiError::Unauthorized("Invalid credentials".into()));
        }
    };

    if !verify_password(&req.password, &user.password_hash) {
        state.audit.log_login(user.id, None, false);
        return Err(ApiError::Unauthorized("Invalid credentials".into()));
    }
    if !user.is_active {
        return Err(ApiError::Unauthorized("Account is not active".into()));
    }

    state.users.record_login(user.id).await?;
    state.audit.log_login(user.id, None, true);

    let token = state.sessions.issue(user.id);

    Ok(Json(AuthResponse {
        token,
        user: UserInfo::from(user),
    }))
}

/// Logout response.
#[derive(Debug, Serialize, ToSchema)]
pub struct LogoutResponse {
    pub status: String,
}

/// Log the current user out and revoke their session.
#[utoipa::path(
    post,
    path = "/api/auth/logout",
    responses(
        (status = 200, description = "Logged out", body = LogoutResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer_auth" = [])),
    tag = "auth"
)]
pub async fn logout(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
) -> ApiResult<Json<LogoutResponse>> {
    state.sessions.revoke_user(user.id);
    state.users.set_online(user.id, false).await?;
    state
        .audit
        .log(AuditEvent::new(AuditAction::Logout, format!("user/{}", user.id)).user(user.id));

    Ok(Json(LogoutResponse {
        status: "success".to_string(),
    }))
}

/// Deprecated cookie-session endpoints are permanently gone.
pub async fn session_gone() -> ApiError {
    ApiError::Gone("Session-based access was removed; use bearer authentication".into())
}
