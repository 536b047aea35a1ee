//! Trade and account read handlers.

use axum::extract::State;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use relay_core::types::{Trade, TradeSide, TradeStatus, User};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::error::ApiResult;
use crate::state::AppState;

/// One trade as exposed over the API.
#[derive(Debug, Serialize, ToSchema)]
pub struct TradeResponse {
    pub id: i64,
    pub ticket: String,
    pub symbol: String,
    #[schema(value_type = String)]
    pub side: TradeSide,
    pub volume: Decimal,
    pub open_price: Decimal,
    pub current_price: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_price: Option<Decimal>,
    pub profit: Decimal,
    #[schema(value_type = String)]
    pub status: TradeStatus,
    pub open_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_time: Option<DateTime<Utc>>,
}

impl From<Trade> for TradeResponse {
    fn from(trade: Trade) -> Self {
        let profit = trade.realized_pnl.unwrap_or(trade.unrealized_pnl);
        Self {
            id: trade.id,
            ticket: trade.ticket,
            symbol: trade.symbol,
            side: trade.side,
            volume: trade.volume,
            open_price: trade.open_price,
            current_price: trade.current_price,
            close_price: trade.close_price,
            profit,
            status: trade.status,
            open_time: trade.open_time,
            close_time: trade.close_time,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TradeListResponse {
    pub trades: Vec<TradeResponse>,
}

/// Open and closed trades for the caller.
#[utoipa::path(
    get,
    path = "/api/trades",
    responses(
        (status = 200, description = "Caller's trades", body = TradeListResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer_auth" = [])),
    tag = "trades"
)]
pub async fn list_trades(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
) -> ApiResult<Json<TradeListResponse>> {
    let trades = state.trades.list_all(user.id).await?;
    Ok(Json(TradeListResponse {
        trades: trades.into_iter().map(TradeResponse::from).collect(),
    }))
}

/// Account summary plus aggregate trading statistics.
#[derive(Debug, Serialize, ToSchema)]
pub struct AccountStatsResponse {
    pub balance: Decimal,
    pub equity: Decimal,
    pub margin: Decimal,
    pub free_margin: Decimal,
    pub margin_level: Decimal,
    pub currency: String,
    pub connected: bool,
    pub total_trades: i64,
    pub open_trades: i64,
    pub closed_trades: i64,
    pub win_rate: Decimal,
    pub total_profit: Decimal,
}

/// Account summary and aggregate trading stats for the caller.
#[utoipa::path(
    get,
    path = "/api/account/stats",
    responses(
        (status = 200, description = "Account statistics", body = AccountStatsResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer_auth" = [])),
    tag = "trades"
)]
pub async fn account_stats(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
) -> ApiResult<Json<AccountStatsResponse>> {
    let connection = state.connections.find_by_user(user.id).await?;
    let stats = state.trades.stats(user.id).await?;

    let response = match connection {
        Some(c) => AccountStatsResponse {
            balance: c.balance,
            equity: c.equity,
            margin: c.margin,
            free_margin: c.free_margin,
            margin_level: c.margin_level,
            currency: c.currency,
            connected: c.is_connected,
            total_trades: stats.total_trades,
            open_trades: stats.open_trades,
            closed_trades: stats.closed_trades,
            win_rate: stats.win_rate,
            total_profit: stats.total_profit,
        },
        None => AccountStatsResponse {
            balance: Decimal::ZERO,
            equity: Decimal::ZERO,
            margin: Decimal::ZERO,
            free_margin: Decimal::ZERO,
            margin_level: Decimal::ZERO,
            currency: "USD".to_string(),
            connected: false,
            total_trades: stats.total_trades,
            open_trades: stats.open_trades,
            closed_trades: stats.closed_trades,
            win_rate: stats.win_rate,
            total_profit: stats.total_profit,
        },
    };

    Ok(Json(response))
}

/// Terminal connection status.
#[derive(Debug, Serialize, ToSchema)]
pub struct Mt5StatusResponse {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Terminal connection status for the caller.
#[utoipa::path(
    get,
    path = "/api/mt5/status",
    responses(
        (status = 200, description = "Connection status", body = Mt5StatusResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer_auth" = [])),
    tag = "trades"
)]
pub async fn mt5_status(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
) -> ApiResult<Json<Mt5StatusResponse>> {
    let response = match state.connections.find_by_user(user.id).await? {
        Some(c) => Mt5StatusResponse {
            // The live command channel is the authoritative liveness signal;
            // the stored flag only reflects the client's last report.
            connected: c.is_connected || state.hub.client_connected(user.id),
            login: c.login,
            server: c.server,
            last_sync: c.last_sync,
            message: None,
        },
        None => Mt5StatusResponse {
            connected: false,
            login: None,
            server: None,
            last_sync: None,
            message: Some("No terminal connection found. Install and run the desktop client.".into()),
        },
    };

    Ok(Json(response))
}
