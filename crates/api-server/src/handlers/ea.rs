//! Client ingestion endpoint.
//!
//! Desktop clients authenticate with their api key inside the payload and
//! push typed snapshots. Authentication resolves through the process-local
//! key cache with a database re-verify on every hit, then the payload's
//! optional identity fields are cross-checked against the key's owner.

use auth::has_key_format;
use axum::extract::{ConnectInfo, State};
use axum::Json;
use relay_core::types::User;
use replication::EaPayload;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Ingestion envelope posted by desktop clients.
#[derive(Debug, Deserialize, ToSchema)]
pub struct EaDataRequest {
    /// Ingestion api key (`ca_*`).
    #[serde(default)]
    pub api_key: Option<String>,
    /// Optional identity cross-check: expected owner id.
    #[serde(default)]
    pub user_id: Option<i64>,
    /// Optional identity cross-check: expected owner username.
    #[serde(default)]
    pub username: Option<String>,
    /// Payload type.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Client-side timestamp, passed through untouched.
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
    /// Typed payload body.
    pub data: serde_json::Value,
    /// Free-form client build info, logged only.
    #[serde(default)]
    pub client_info: Option<serde_json::Value>,
}

/// Ingestion acknowledgement.
#[derive(Debug, Serialize, ToSchema)]
pub struct EaDataResponse {
    pub status: String,
}

/// Receive a data payload from a desktop client.
#[utoipa::path(
    post,
    path = "/api/ea/data",
    request_body = EaDataRequest,
    responses(
        (status = 200, description = "Payload accepted", body = EaDataResponse),
        (status = 400, description = "Unknown message type or malformed data"),
        (status = 401, description = "Missing or invalid API key"),
        (status = 403, description = "Identity mismatch"),
    ),
    tag = "ingestion"
)]
pub async fn ea_data(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<EaDataRequest>,
) -> ApiResult<Json<EaDataResponse>> {
    let source_ip = addr.ip();

    let api_key = match req.api_key.as_deref().filter(|k| !k.is_empty()) {
        Some(key) => key,
        None => {
            state
                .audit
                .log_key_rejected("missing api key", Some(source_ip));
            return Err(ApiError::Unauthorized("API key required".into()));
        }
    };

    if !has_key_format(api_key) {
        state
            .audit
            .log_key_rejected("malformed api key", Some(source_ip));
        return Err(ApiError::Unauthorized("Invalid API key".into()));
    }

    let user = authenticate(&state, api_key, source_ip).await?;

    // Cross-verify the optional identity fields against the key's owner.
    if let Some(claimed_id) = req.user_id {
        if claimed_id != user.id {
            state.audit.log_identity_mismatch(
                user.id,
                format!("payload user_id {claimed_id} does not match key owner"),
            );
            return Err(ApiError::Forbidden("Identity mismatch".into()));
        }
    }
    if let Some(claimed_username) = req.username.as_deref() {
        if claimed_username != user.username {
            state.audit.log_identity_mismatch(
                user.id,
                format!("payload username {claimed_username:?} does not match key owner"),
            );
            return Err(ApiError::Forbidden("Identity mismatch".into()));
        }
    }

    // IP binding: fixed on first authenticated ingestion; afterwards a
    // different source is logged prominently but currently permitted.
    match user.last_login_ip.as_deref() {
        None => {
            state
                .users
                .bind_login_ip(user.id, &source_ip.to_string())
                .await?;
            info!(user_id = user.id, ip = %source_ip, "Ingestion IP bound");
        }
        Some(bound) if bound != source_ip.to_string() => {
            warn!(
                user_id = user.id,
                bound_ip = bound,
                source_ip = %source_ip,
                "Ingestion from unexpected IP"
            );
            state.audit.log_ip_changed(user.id, bound, source_ip);
        }
        Some(_) => {}
    }

    if let Some(client_info) = &req.client_info {
        tracing::debug!(user_id = user.id, client_info = %client_info, "Client info");
    }

    let payload = EaPayload::parse(&req.message_type, req.data)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    state.reconciler.process(&user, payload).await?;
    state.users.touch_last_seen(user.id).await?;

    Ok(Json(EaDataResponse {
        status: "success".to_string(),
    }))
}

/// Resolve an api key to its active owner.
///
/// The positive cache short-circuits the key lookup, but every hit is
/// re-verified against the database row so a rotated or deactivated key dies
/// within one request.
async fn authenticate(
    state: &AppState,
    api_key: &str,
    source_ip: std::net::IpAddr,
) -> ApiResult<User> {
    if let Some(cached_user_id) = state.api_keys.get(api_key) {
        match state.users.find_by_id(cached_user_id).await? {
            Some(user) if user.api_key.as_deref() == Some(api_key) && user.is_active => {
                return Ok(user);
            }
            _ => {
                // Stale cache: the key was rotated or the account disabled.
                state.api_keys.invalidate_user(cached_user_id);
            }
        }
    }

    match state.users.find_by_api_key(api_key).await? {
        Some(user) if user.is_active => {
            state.api_keys.insert(api_key, user.id);
            Ok(user)
        }
        Some(user) => {
            state
                .audit
                .log_key_rejected(format!("inactive account {}", user.id), Some(source_ip));
            Err(ApiError::Unauthorized("Account is not active".into()))
        }
        None => {
            state
                .audit
                .log_key_rejected("unknown api key", Some(source_ip));
            Err(ApiError::Unauthorized("Invalid API key".into()))
        }
    }
}
