//! Database operations for the trade store.
//!
//! Trades are addressed by (user_id, ticket). Reconciliation writes run
//! inside the caller's transaction; reads go through the pool.

use crate::types::{
    HistoryTradeSnapshot, PositionSnapshot, Trade, TradeSide, TradeStatus,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use std::collections::HashSet;

/// Aggregate trading statistics for one owner.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TradeStats {
    pub total_trades: i64,
    pub open_trades: i64,
    pub closed_trades: i64,
    pub winning_trades: i64,
    pub total_profit: Decimal,
    pub win_rate: Decimal,
}

/// Repository for master and follower positions.
#[derive(Clone)]
pub struct TradeStore {
    pool: PgPool,
}

impl TradeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert or refresh an open position from a snapshot.
    ///
    /// Returns the stored trade and whether the row was newly created. A
    /// re-appearing ticket that was previously closed is reopened and counts
    /// as not-created.
    pub async fn upsert_open(
        &self,
        conn: &mut PgConnection,
        owner_id: i64,
        snapshot: &PositionSnapshot,
    ) -> Result<(Trade, bool)> {
        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM trades WHERE user_id = $1 AND ticket = $2")
                .bind(owner_id)
                .bind(&snapshot.ticket)
                .fetch_optional(&mut *conn)
                .await?;

        let row = match existing {
            Some((id,)) => {
                sqlx::query(
                    r#"
                    UPDATE trades SET
                        symbol = $2,
                        side = $3,
                        volume = $4,
                        open_price = $5,
                        current_price = $6,
                        stop_loss = $7,
                        take_profit = $8,
                        unrealized_pnl = $9,
                        swap = $10,
                        commission = $11,
                        status = 'open',
                        close_price = NULL,
                        close_time = NULL,
                        realized_pnl = NULL
                    WHERE id = $1
                    RETURNING *
                    "#,
                )
                .bind(id)
                .bind(&snapshot.symbol)
                .bind(snapshot.side.as_str())
                .bind(snapshot.volume)
                .bind(snapshot.open_price)
                .bind(snapshot.current_price)
                .bind(snapshot.stop_loss())
                .bind(snapshot.take_profit())
                .bind(snapshot.profit)
                .bind(snapshot.swap.unwrap_or(Decimal::ZERO))
                .bind(snapshot.commission.unwrap_or(Decimal::ZERO))
                .fetch_one(&mut *conn)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO trades (
                        user_id, ticket, symbol, side, volume,
                        open_price, current_price, stop_loss, take_profit,
                        unrealized_pnl, swap, commission,
                        open_time, status, created_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, 'open', $14)
                    RETURNING *
                    "#,
                )
                .bind(owner_id)
                .bind(&snapshot.ticket)
                .bind(&snapshot.symbol)
                .bind(snapshot.side.as_str())
                .bind(snapshot.volume)
                .bind(snapshot.open_price)
                .bind(snapshot.current_price)
                .bind(snapshot.stop_loss())
                .bind(snapshot.take_profit())
                .bind(snapshot.profit)
                .bind(snapshot.swap.unwrap_or(Decimal::ZERO))
                .bind(snapshot.commission.unwrap_or(Decimal::ZERO))
                .bind(snapshot.open_time_utc())
                .bind(Utc::now())
                .fetch_one(&mut *conn)
                .await?
            }
        };

        let created = existing.is_none();
        Ok((row_to_trade(&row)?, created))
    }

    /// Close a trade. Idempotent: an already-closed trade is returned as-is.
    pub async fn close(
        &self,
        conn: &mut PgConnection,
        owner_id: i64,
        ticket: &str,
        close_price: Option<Decimal>,
        close_time: DateTime<Utc>,
    ) -> Result<Option<Trade>> {
        let row = sqlx::query(
            r#"
            UPDATE trades SET
                status = 'closed',
                close_price = COALESCE($3, current_price),
                close_time = $4,
                realized_pnl = unrealized_pnl
            WHERE user_id = $1 AND ticket = $2 AND status = 'open'
            RETURNING *
            "#,
        )
        .bind(owner_id)
        .bind(ticket)
        .bind(close_price)
        .bind(close_time)
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some(row) => Ok(Some(row_to_trade(&row)?)),
            None => self.find_by_ticket_in(conn, owner_id, ticket).await,
        }
    }

    /// Append a closed trade from a history import. Returns false when the
    /// ticket already exists (duplicates are skipped, never mutated).
    pub async fn insert_closed_history(
        &self,
        conn: &mut PgConnection,
        owner_id: i64,
        snapshot: &HistoryTradeSnapshot,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO trades (
                user_id, ticket, symbol, side, volume,
                open_price, current_price, close_price,
                unrealized_pnl, realized_pnl, swap, commission,
                open_time, close_time, status, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7, $8, $8, $9, $10, $11, $12, 'closed', $13)
            ON CONFLICT (user_id, ticket) DO NOTHING
            "#,
        )
        .bind(owner_id)
        .bind(&snapshot.ticket)
        .bind(&snapshot.symbol)
        .bind(snapshot.side.as_str())
        .bind(snapshot.volume)
        .bind(snapshot.open_price)
        .bind(snapshot.close_price)
        .bind(snapshot.profit)
        .bind(snapshot.swap.unwrap_or(Decimal::ZERO))
        .bind(snapshot.commission.unwrap_or(Decimal::ZERO))
        .bind(snapshot.open_time_utc())
        .bind(snapshot.close_time_utc())
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Open trades for an owner, read inside the caller's transaction.
    pub async fn open_trades_in(
        &self,
        conn: &mut PgConnection,
        owner_id: i64,
    ) -> Result<Vec<Trade>> {
        let rows = sqlx::query(
            "SELECT * FROM trades WHERE user_id = $1 AND status = 'open' ORDER BY open_time",
        )
        .bind(owner_id)
        .fetch_all(&mut *conn)
        .await?;

        rows.iter().map(row_to_trade).collect()
    }

    pub async fn find_by_ticket_in(
        &self,
        conn: &mut PgConnection,
        owner_id: i64,
        ticket: &str,
    ) -> Result<Option<Trade>> {
        let row = sqlx::query("SELECT * FROM trades WHERE user_id = $1 AND ticket = $2")
            .bind(owner_id)
            .bind(ticket)
            .fetch_optional(&mut *conn)
            .await?;

        row.as_ref().map(row_to_trade).transpose()
    }

    pub async fn list_open(&self, owner_id: i64) -> Result<Vec<Trade>> {
        let mut conn = self.pool.acquire().await?;
        self.open_trades_in(&mut *conn, owner_id).await
    }

    pub async fn list_all(&self, owner_id: i64) -> Result<Vec<Trade>> {
        let rows = sqlx::query(
            "SELECT * FROM trades WHERE user_id = $1 ORDER BY open_time DESC LIMIT 500",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_trade).collect()
    }

    pub async fn list_open_tickets(&self, owner_id: i64) -> Result<HashSet<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT ticket FROM trades WHERE user_id = $1 AND status = 'open'")
                .bind(owner_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(|(t,)| t).collect())
    }

    pub async fn find_by_ticket(&self, owner_id: i64, ticket: &str) -> Result<Option<Trade>> {
        let mut conn = self.pool.acquire().await?;
        self.find_by_ticket_in(&mut *conn, owner_id, ticket).await
    }

    /// Close a trade outside a reconciliation transaction (confirmation path).
    pub async fn close_confirmed(
        &self,
        owner_id: i64,
        ticket: &str,
        close_time: DateTime<Utc>,
    ) -> Result<Option<Trade>> {
        let mut conn = self.pool.acquire().await?;
        self.close(&mut *conn, owner_id, ticket, None, close_time)
            .await
    }

    /// Aggregate stats for the account overview.
    pub async fn stats(&self, owner_id: i64) -> Result<TradeStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total_trades,
                COUNT(*) FILTER (WHERE status = 'open') AS open_trades,
                COUNT(*) FILTER (WHERE status = 'closed') AS closed_trades,
                COUNT(*) FILTER (WHERE status = 'closed' AND realized_pnl > 0) AS winning_trades,
                COALESCE(SUM(realized_pnl) FILTER (WHERE status = 'closed'), 0) AS total_profit
            FROM trades
            WHERE user_id = $1
            "#,
        )
        .bind(owner_id)
        .fetch_one(&self.pool)
        .await?;

        let total_trades: i64 = row.get("total_trades");
        let closed_trades: i64 = row.get("closed_trades");
        let winning_trades: i64 = row.get("winning_trades");
        let win_rate = if closed_trades > 0 {
            Decimal::new(winning_trades * 100, 0) / Decimal::new(closed_trades, 0)
        } else {
            Decimal::ZERO
        };

        Ok(TradeStats {
            total_trades,
            open_trades: row.get("open_trades"),
            closed_trades,
            winning_trades,
            total_profit: row.get("total_profit"),
            win_rate,
        })
    }
}

/// Convert a database row to a Trade.
pub(crate) fn row_to_trade(row: &PgRow) -> Result<Trade> {
    let side_raw: String = row.get("side");
    let side = TradeSide::parse(&side_raw)
        .ok_or_else(|| Error::Validation(format!("invalid trade side in database: {side_raw}")))?;
    let status_raw: String = row.get("status");
    let status = TradeStatus::parse(&status_raw).ok_or_else(|| {
        Error::Validation(format!("invalid trade status in database: {status_raw}"))
    })?;

    Ok(Trade {
        id: row.get("id"),
        user_id: row.get("user_id"),
        ticket: row.get("ticket"),
        symbol: row.get("symbol"),
        side,
        volume: row.get("volume"),
        open_price: row.get("open_price"),
        current_price: row.get("current_price"),
        close_price: row.get("close_price"),
        stop_loss: row.get("stop_loss"),
        take_profit: row.get("take_profit"),
        unrealized_pnl: row.get("unrealized_pnl"),
        realized_pnl: row.get("realized_pnl"),
        swap: row.get("swap"),
        commission: row.get("commission"),
        open_time: row.get("open_time"),
        close_time: row.get("close_time"),
        status,
        created_at: row.get("created_at"),
    })
}
