//! User profile and key management handlers.

use auth::{issue_unique_key, AuditAction, AuditEvent};
use axum::extract::State;
use axum::{Extension, Json};
use relay_core::types::User;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use crate::error::ApiResult;
use crate::handlers::auth::UserInfo;
use crate::state::AppState;

/// Profile with connection flag.
#[derive(Debug, Serialize, ToSchema)]
pub struct ProfileResponse {
    #[serde(flatten)]
    pub user: UserInfo,
    pub mt5_connected: bool,
}

/// The caller's profile, including their api key.
#[utoipa::path(
    get,
    path = "/api/user/profile",
    responses(
        (status = 200, description = "Profile", body = ProfileResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer_auth" = [])),
    tag = "users"
)]
pub async fn profile(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
) -> ApiResult<Json<ProfileResponse>> {
    let mt5_connected = state.hub.client_connected(user.id)
        || state
            .connections
            .find_by_user(user.id)
            .await?
            .map(|c| c.is_connected)
            .unwrap_or(false);

    Ok(Json(ProfileResponse {
        user: UserInfo::from(user),
        mt5_connected,
    }))
}

/// Master-trader toggle request.
#[derive(Debug, Deserialize, ToSchema)]
pub struct MasterTraderRequest {
    pub is_master_trader: bool,
}

/// Master-trader toggle response.
#[derive(Debug, Serialize, ToSchema)]
pub struct MasterTraderResponse {
    pub is_master_trader: bool,
}

/// Opt in or out of being copied by others.
#[utoipa::path(
    post,
    path = "/api/user/master-trader",
    request_body = MasterTraderRequest,
    responses(
        (status = 200, description = "Flag updated", body = MasterTraderResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer_auth" = [])),
    tag = "users"
)]
pub async fn set_master_trader(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Json(req): Json<MasterTraderRequest>,
) -> ApiResult<Json<MasterTraderResponse>> {
    state
        .users
        .set_master_trader(user.id, req.is_master_trader)
        .await?;

    tracing::info!(
        user_id = user.id,
        is_master_trader = req.is_master_trader,
        "Master trader flag updated"
    );

    Ok(Json(MasterTraderResponse {
        is_master_trader: req.is_master_trader,
    }))
}

/// Key rotation response. The old key never authenticates again.
#[derive(Debug, Serialize, ToSchema)]
pub struct RegenerateKeyResponse {
    pub api_key: String,
}

/// Rotate the caller's ingestion api key.
#[utoipa::path(
    post,
    path = "/api/user/regenerate-api-key",
    responses(
        (status = 200, description = "New api key", body = RegenerateKeyResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer_auth" = [])),
    tag = "users"
)]
pub async fn regenerate_api_key(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
) -> ApiResult<Json<RegenerateKeyResponse>> {
    let api_key = issue_unique_key(&state.users, user.id).await?;

    // The process-local cache must die with the old key.
    state.api_keys.invalidate_user(user.id);

    state.audit.log(
        AuditEvent::new(AuditAction::ApiKeyRotated, format!("user/{}", user.id)).user(user.id),
    );

    Ok(Json(RegenerateKeyResponse { api_key }))
}
