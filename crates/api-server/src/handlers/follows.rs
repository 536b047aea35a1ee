//! Follow graph handlers.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use relay_core::types::{Follow, User};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Optional per-edge copy settings.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct FollowRequest {
    /// Percentage of master volume to copy, 0–100. Defaults to 100.
    #[serde(default)]
    pub copy_percentage: Option<Decimal>,
    /// Risk budget per trade as a percentage of equity, 0.1–10. Defaults to 2.
    #[serde(default)]
    pub max_risk_per_trade: Option<Decimal>,
}

/// Follow edge representation.
#[derive(Debug, Serialize, ToSchema)]
pub struct FollowResponse {
    pub id: i64,
    pub follower_id: i64,
    pub master_id: i64,
    pub copy_percentage: Decimal,
    pub max_risk_per_trade: Decimal,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<Follow> for FollowResponse {
    fn from(follow: Follow) -> Self {
        Self {
            id: follow.id,
            follower_id: follow.follower_id,
            master_id: follow.following_id,
            copy_percentage: follow.copy_percentage,
            max_risk_per_trade: follow.max_risk_per_trade,
            is_active: follow.is_active,
            created_at: follow.created_at,
        }
    }
}

/// Start copying a master trader.
#[utoipa::path(
    post,
    path = "/api/follow/{master_id}",
    params(("master_id" = i64, Path, description = "Master user id")),
    request_body = FollowRequest,
    responses(
        (status = 200, description = "Follow edge created", body = FollowResponse),
        (status = 400, description = "Self-follow or invalid copy settings"),
        (status = 404, description = "Master not found"),
    ),
    security(("bearer_auth" = [])),
    tag = "follows"
)]
pub async fn follow_master(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Path(master_id): Path<i64>,
    body: Bytes,
) -> ApiResult<Json<FollowResponse>> {
    if master_id == user.id {
        return Err(ApiError::BadRequest("Cannot follow yourself".into()));
    }

    let master = state
        .users
        .find_by_id(master_id)
        .await?
        .filter(|m| m.is_active && m.is_master_trader)
        .ok_or_else(|| ApiError::NotFound("Master trader not found".into()))?;

    // The body is optional; defaults apply when the client sends none.
    let settings: FollowRequest = if body.is_empty() {
        FollowRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid follow settings: {e}")))?
    };
    let copy_percentage = settings.copy_percentage.unwrap_or(Decimal::new(100, 0));
    let max_risk = settings.max_risk_per_trade.unwrap_or(Decimal::new(2, 0));

    if copy_percentage < Decimal::ZERO || copy_percentage > Decimal::new(100, 0) {
        return Err(ApiError::BadRequest(
            "copy_percentage must be between 0 and 100".into(),
        ));
    }
    if max_risk < Decimal::new(1, 1) || max_risk > Decimal::new(10, 0) {
        return Err(ApiError::BadRequest(
            "max_risk_per_trade must be between 0.1 and 10".into(),
        ));
    }

    let follow = state
        .follows
        .create(user.id, master.id, copy_percentage, max_risk)
        .await?;

    tracing::info!(
        follower_id = user.id,
        master_id = master.id,
        "Follow edge activated"
    );

    Ok(Json(FollowResponse::from(follow)))
}

/// Unfollow status response.
#[derive(Debug, Serialize, ToSchema)]
pub struct UnfollowResponse {
    pub status: String,
}

/// Stop copying a master trader.
#[utoipa::path(
    delete,
    path = "/api/unfollow/{master_id}",
    params(("master_id" = i64, Path, description = "Master user id")),
    responses(
        (status = 200, description = "Follow edge deactivated", body = UnfollowResponse),
        (status = 404, description = "No active follow edge"),
    ),
    security(("bearer_auth" = [])),
    tag = "follows"
)]
pub async fn unfollow_master(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Path(master_id): Path<i64>,
) -> ApiResult<Json<UnfollowResponse>> {
    let removed = state.follows.deactivate(user.id, master_id).await?;
    if !removed {
        return Err(ApiError::NotFound("Not following this trader".into()));
    }

    tracing::info!(
        follower_id = user.id,
        master_id,
        "Follow edge deactivated"
    );

    Ok(Json(UnfollowResponse {
        status: "success".to_string(),
    }))
}
