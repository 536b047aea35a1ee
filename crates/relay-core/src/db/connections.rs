//! Database operations for cached terminal connections.

use crate::types::{normalize_margin_level, AccountInfoPayload, Mt5Connection};
use crate::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::PgPool;

/// Repository for per-user MT5 connection rows (one per user).
#[derive(Clone)]
pub struct ConnectionRepository {
    pool: PgPool,
}

impl ConnectionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_user(&self, user_id: i64) -> Result<Option<Mt5Connection>> {
        let connection = sqlx::query_as("SELECT * FROM mt5_connections WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(connection)
    }

    /// Write the account summary from an account_update payload.
    ///
    /// The margin level is normalized before storage; see
    /// `normalize_margin_level` for the sentinel and recompute rules.
    pub async fn upsert_account(
        &self,
        user_id: i64,
        account: &AccountInfoPayload,
    ) -> Result<Mt5Connection> {
        let margin_level =
            normalize_margin_level(account.margin_level, account.equity, account.margin);
        let currency = account.currency.as_deref().unwrap_or("USD");

        let connection = sqlx::query_as(
            r#"
            INSERT INTO mt5_connections (
                user_id, login, is_connected, balance, equity, margin,
                free_margin, margin_level, currency, last_sync, created_at
            )
            VALUES ($1, $2, TRUE, $3, $4, $5, $6, $7, $8, $9, $9)
            ON CONFLICT (user_id) DO UPDATE SET
                login = COALESCE(EXCLUDED.login, mt5_connections.login),
                balance = EXCLUDED.balance,
                equity = EXCLUDED.equity,
                margin = EXCLUDED.margin,
                free_margin = EXCLUDED.free_margin,
                margin_level = EXCLUDED.margin_level,
                currency = EXCLUDED.currency,
                last_sync = EXCLUDED.last_sync
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(account.login)
        .bind(account.balance)
        .bind(account.equity)
        .bind(account.margin)
        .bind(account.free_margin)
        .bind(margin_level)
        .bind(currency)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(connection)
    }

    /// Flip the connected flag, optionally refreshing login/server.
    pub async fn set_connected(
        &self,
        user_id: i64,
        connected: bool,
        login: Option<i64>,
        server: Option<&str>,
    ) -> Result<Mt5Connection> {
        let connection = sqlx::query_as(
            r#"
            INSERT INTO mt5_connections (
                user_id, login, server, is_connected, balance, equity, margin,
                free_margin, margin_level, currency, last_sync, created_at
            )
            VALUES ($1, $2, $3, $4, 0, 0, 0, 0, 0, 'USD', $5, $5)
            ON CONFLICT (user_id) DO UPDATE SET
                is_connected = EXCLUDED.is_connected,
                login = COALESCE(EXCLUDED.login, mt5_connections.login),
                server = COALESCE(EXCLUDED.server, mt5_connections.server),
                last_sync = EXCLUDED.last_sync
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(login)
        .bind(server)
        .bind(connected)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(connection)
    }

    /// Cached equity for sizing, when the follower has synced an account.
    pub async fn equity_of(&self, user_id: i64) -> Result<Option<Decimal>> {
        let row: Option<(Decimal,)> =
            sqlx::query_as("SELECT equity FROM mt5_connections WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(equity,)| equity))
    }
}
