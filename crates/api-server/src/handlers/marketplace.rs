//! Marketplace read handlers.

use axum::extract::State;
use axum::Json;
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::Row;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::error::ApiResult;
use crate::state::AppState;

/// One master trader with aggregate metrics.
#[derive(Debug, Serialize, ToSchema)]
pub struct TraderSummary {
    pub id: i64,
    pub username: String,
    pub is_online: bool,
    pub total_trades: i64,
    pub win_rate: Decimal,
    pub total_profit: Decimal,
    pub followers: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TraderListResponse {
    pub traders: Vec<TraderSummary>,
}

/// List master traders with aggregate metrics.
#[utoipa::path(
    get,
    path = "/api/marketplace/traders",
    responses(
        (status = 200, description = "Master traders", body = TraderListResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer_auth" = [])),
    tag = "marketplace"
)]
pub async fn list_traders(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<TraderListResponse>> {
    // One aggregate pass over users/trades/follows; per-trader loops would
    // be an N+1 on the hot marketplace page.
    let rows = sqlx::query(
        r#"
        SELECT
            u.id,
            u.username,
            u.is_online,
            COUNT(t.id) AS total_trades,
            COUNT(t.id) FILTER (WHERE t.status = 'closed' AND t.realized_pnl > 0) AS winning_trades,
            COUNT(t.id) FILTER (WHERE t.status = 'closed') AS closed_trades,
            COALESCE(SUM(t.realized_pnl) FILTER (WHERE t.status = 'closed'), 0) AS total_profit,
            (SELECT COUNT(*) FROM follows f
             WHERE f.following_id = u.id AND f.is_active = TRUE) AS followers
        FROM users u
        LEFT JOIN trades t ON t.user_id = u.id
        WHERE u.is_master_trader = TRUE AND u.is_active = TRUE
        GROUP BY u.id, u.username, u.is_online
        ORDER BY total_profit DESC
        "#,
    )
    .fetch_all(&state.pool)
    .await?;

    let traders = rows
        .into_iter()
        .map(|row| {
            let closed: i64 = row.get("closed_trades");
            let winning: i64 = row.get("winning_trades");
            let win_rate = if closed > 0 {
                Decimal::new(winning * 100, 0) / Decimal::new(closed, 0)
            } else {
                Decimal::ZERO
            };
            TraderSummary {
                id: row.get("id"),
                username: row.get("username"),
                is_online: row.get("is_online"),
                total_trades: row.get("total_trades"),
                win_rate,
                total_profit: row.get("total_profit"),
                followers: row.get("followers"),
            }
        })
        .collect();

    Ok(Json(TraderListResponse { traders }))
}
