//! Database operations for the copy-trade ledger.
//!
//! Every replication attempt is a ledger record correlating a master trade
//! with the follower position it produced. The copy hash is the durable
//! correlation key; the follower ticket is the fast key. Confirmation
//! lookups are always scoped to the follower whose channel delivered them.

use crate::types::{CopyTrade, CopyTradeStatus, Follow, Trade, TradeSide};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};

/// Repository for copy-trade records.
#[derive(Clone)]
pub struct CopyTradeLedger {
    pool: PgPool,
}

impl CopyTradeLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a pending replication record.
    ///
    /// Returns None when a non-terminal record already exists for this
    /// (follow, master trade) pair; the partial unique index backs this up
    /// under concurrent backfill and live dispatch.
    pub async fn create_pending(
        &self,
        follow: &Follow,
        master_trade: &Trade,
        follower_volume: Decimal,
        copy_ratio: Decimal,
        copy_hash: &str,
    ) -> Result<Option<CopyTrade>> {
        let existing: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT id FROM copy_trades
            WHERE follow_id = $1 AND master_trade_id = $2 AND status IN ('pending', 'executed')
            "#,
        )
        .bind(follow.id)
        .bind(master_trade.id)
        .fetch_optional(&self.pool)
        .await?;

        if existing.is_some() {
            return Ok(None);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO copy_trades (
                follow_id, master_trade_id, master_ticket,
                symbol, side, master_volume, follower_volume, copy_ratio,
                copy_hash, status, retry_count, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending', 0, $10)
            ON CONFLICT DO NOTHING
            RETURNING *
            "#,
        )
        .bind(follow.id)
        .bind(master_trade.id)
        .bind(&master_trade.ticket)
        .bind(&master_trade.symbol)
        .bind(master_trade.side.as_str())
        .bind(master_trade.volume)
        .bind(follower_volume)
        .bind(copy_ratio)
        .bind(copy_hash)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        result.as_ref().map(row_to_copy_trade).transpose()
    }

    /// Record why a pending dispatch could not go out (client offline,
    /// channel overflow). The record stays pending for backfill.
    pub async fn note_pending_reason(&self, id: i64, reason: &str) -> Result<()> {
        sqlx::query("UPDATE copy_trades SET error = $1 WHERE id = $2 AND status = 'pending'")
            .bind(reason)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Whether record `id` may move to `next` under the status machine
    /// (pending→executed→closed, pending→failed). The SQL status guards on
    /// the updates below remain the concurrent backstop.
    async fn transition_allowed_in(
        conn: &mut PgConnection,
        id: i64,
        next: CopyTradeStatus,
    ) -> Result<bool> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT status FROM copy_trades WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?;
        let Some((raw,)) = row else {
            return Ok(false);
        };
        let current = CopyTradeStatus::parse(&raw)
            .ok_or_else(|| Error::Validation(format!("invalid status in copy_trades: {raw}")))?;
        Ok(current.can_transition_to(next))
    }

    /// Promote a pending record to executed, linking the follower's ticket.
    pub async fn link_execution(
        &self,
        id: i64,
        follower_ticket: &str,
        follower_trade_id: Option<i64>,
    ) -> Result<Option<CopyTrade>> {
        let mut conn = self.pool.acquire().await?;
        self.link_execution_in(&mut *conn, id, follower_ticket, follower_trade_id)
            .await
    }

    pub async fn link_execution_in(
        &self,
        conn: &mut PgConnection,
        id: i64,
        follower_ticket: &str,
        follower_trade_id: Option<i64>,
    ) -> Result<Option<CopyTrade>> {
        if !Self::transition_allowed_in(&mut *conn, id, CopyTradeStatus::Executed).await? {
            return Ok(None);
        }

        let row = sqlx::query(
            r#"
            UPDATE copy_trades SET
                status = 'executed',
                follower_ticket = $2,
                follower_trade_id = COALESCE($3, follower_trade_id),
                error = NULL,
                executed_at = $4
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(follower_ticket)
        .bind(follower_trade_id)
        .bind(Utc::now())
        .fetch_optional(&mut *conn)
        .await?;

        row.as_ref().map(row_to_copy_trade).transpose()
    }

    /// Backfill the follower trade id once the follower's snapshot created
    /// the trade row.
    pub async fn attach_follower_trade_in(
        &self,
        conn: &mut PgConnection,
        id: i64,
        follower_trade_id: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE copy_trades SET follower_trade_id = $2 WHERE id = $1 AND follower_trade_id IS NULL",
        )
        .bind(id)
        .bind(follower_trade_id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Terminate a record as closed. Only non-terminal records transition.
    pub async fn mark_closed(&self, id: i64, at: DateTime<Utc>) -> Result<Option<CopyTrade>> {
        let mut conn = self.pool.acquire().await?;
        if !Self::transition_allowed_in(&mut *conn, id, CopyTradeStatus::Closed).await? {
            return Ok(None);
        }

        let row = sqlx::query(
            r#"
            UPDATE copy_trades SET status = 'closed', closed_at = $2
            WHERE id = $1 AND status IN ('pending', 'executed')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(at)
        .fetch_optional(&mut *conn)
        .await?;

        row.as_ref().map(row_to_copy_trade).transpose()
    }

    /// Terminate a pending record as failed and count the attempt.
    pub async fn mark_failed(&self, id: i64, reason: &str) -> Result<Option<CopyTrade>> {
        let mut conn = self.pool.acquire().await?;
        if !Self::transition_allowed_in(&mut *conn, id, CopyTradeStatus::Failed).await? {
            return Ok(None);
        }

        let row = sqlx::query(
            r#"
            UPDATE copy_trades SET
                status = 'failed',
                error = $2,
                retry_count = retry_count + 1
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(reason)
        .fetch_optional(&mut *conn)
        .await?;

        row.as_ref().map(row_to_copy_trade).transpose()
    }

    /// Follower-scoped non-terminal lookup by the durable hash key.
    pub async fn find_active_by_hash(
        &self,
        follower_id: i64,
        copy_hash: &str,
    ) -> Result<Option<CopyTrade>> {
        let row = sqlx::query(
            r#"
            SELECT ct.* FROM copy_trades ct
            JOIN follows f ON f.id = ct.follow_id
            WHERE f.follower_id = $1 AND ct.copy_hash = $2
              AND ct.status IN ('pending', 'executed')
            ORDER BY ct.id DESC
            LIMIT 1
            "#,
        )
        .bind(follower_id)
        .bind(copy_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_copy_trade).transpose()
    }

    /// Follower-scoped non-terminal lookup by the fast ticket key.
    pub async fn find_active_by_follower_ticket(
        &self,
        follower_id: i64,
        follower_ticket: &str,
    ) -> Result<Option<CopyTrade>> {
        let row = sqlx::query(
            r#"
            SELECT ct.* FROM copy_trades ct
            JOIN follows f ON f.id = ct.follow_id
            WHERE f.follower_id = $1 AND ct.follower_ticket = $2
              AND ct.status IN ('pending', 'executed')
            ORDER BY ct.id DESC
            LIMIT 1
            "#,
        )
        .bind(follower_id)
        .bind(follower_ticket)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_copy_trade).transpose()
    }

    /// Last-resort correlation: the follower's single pending record for a
    /// master ticket.
    pub async fn find_pending_by_master_ticket(
        &self,
        follower_id: i64,
        master_ticket: &str,
    ) -> Result<Option<CopyTrade>> {
        let row = sqlx::query(
            r#"
            SELECT ct.* FROM copy_trades ct
            JOIN follows f ON f.id = ct.follow_id
            WHERE f.follower_id = $1 AND ct.master_ticket = $2 AND ct.status = 'pending'
            ORDER BY ct.id DESC
            LIMIT 1
            "#,
        )
        .bind(follower_id)
        .bind(master_ticket)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_copy_trade).transpose()
    }

    /// Non-terminal records for a follower, read inside the reconciliation
    /// transaction. Pending ones are promotable from a snapshot (matched by
    /// follower ticket or broker-comment hash tag); executed ones may still
    /// be missing their follower trade id.
    pub async fn find_active_for_follower_in(
        &self,
        conn: &mut PgConnection,
        follower_id: i64,
    ) -> Result<Vec<CopyTrade>> {
        let rows = sqlx::query(
            r#"
            SELECT ct.* FROM copy_trades ct
            JOIN follows f ON f.id = ct.follow_id
            WHERE f.follower_id = $1 AND ct.status IN ('pending', 'executed')
            "#,
        )
        .bind(follower_id)
        .fetch_all(&mut *conn)
        .await?;

        rows.iter().map(row_to_copy_trade).collect()
    }

    /// Executed records mirroring a specific master ticket, with the user id
    /// of the follower each one belongs to.
    pub async fn executed_for_master_ticket(
        &self,
        master_id: i64,
        master_ticket: &str,
    ) -> Result<Vec<(CopyTrade, i64)>> {
        let rows = sqlx::query(
            r#"
            SELECT ct.*, f.follower_id AS follower_user_id FROM copy_trades ct
            JOIN follows f ON f.id = ct.follow_id
            WHERE f.following_id = $1 AND ct.master_ticket = $2 AND ct.status = 'executed'
            ORDER BY ct.id
            "#,
        )
        .bind(master_id)
        .bind(master_ticket)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Ok((row_to_copy_trade(row)?, row.get("follower_user_id"))))
            .collect()
    }

    /// Every record still executed under a master (mass-close path).
    pub async fn executed_under_master(&self, master_id: i64) -> Result<Vec<(CopyTrade, i64)>> {
        let rows = sqlx::query(
            r#"
            SELECT ct.*, f.follower_id AS follower_user_id FROM copy_trades ct
            JOIN follows f ON f.id = ct.follow_id
            WHERE f.following_id = $1 AND ct.status = 'executed'
            ORDER BY ct.id
            "#,
        )
        .bind(master_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Ok((row_to_copy_trade(row)?, row.get("follower_user_id"))))
            .collect()
    }

    /// Backfill debounce check: is this master trade already represented for
    /// this follow edge?
    pub async fn has_active_record(&self, follow_id: i64, master_trade_id: i64) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT id FROM copy_trades
            WHERE follow_id = $1 AND master_trade_id = $2 AND status IN ('pending', 'executed')
            "#,
        )
        .bind(follow_id)
        .bind(master_trade_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<CopyTrade>> {
        let row = sqlx::query("SELECT * FROM copy_trades WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_copy_trade).transpose()
    }
}

/// Convert a database row to a CopyTrade.
fn row_to_copy_trade(row: &PgRow) -> Result<CopyTrade> {
    let side_raw: String = row.get("side");
    let side = TradeSide::parse(&side_raw)
        .ok_or_else(|| Error::Validation(format!("invalid side in copy_trades: {side_raw}")))?;
    let status_raw: String = row.get("status");
    let status = CopyTradeStatus::parse(&status_raw)
        .ok_or_else(|| Error::Validation(format!("invalid status in copy_trades: {status_raw}")))?;

    Ok(CopyTrade {
        id: row.get("id"),
        follow_id: row.get("follow_id"),
        master_trade_id: row.get("master_trade_id"),
        follower_trade_id: row.get("follower_trade_id"),
        master_ticket: row.get("master_ticket"),
        follower_ticket: row.get("follower_ticket"),
        symbol: row.get("symbol"),
        side,
        master_volume: row.get("master_volume"),
        follower_volume: row.get("follower_volume"),
        copy_ratio: row.get("copy_ratio"),
        copy_hash: row.get("copy_hash"),
        status,
        error: row.get("error"),
        retry_count: row.get("retry_count"),
        created_at: row.get("created_at"),
        executed_at: row.get("executed_at"),
        closed_at: row.get("closed_at"),
    })
}
