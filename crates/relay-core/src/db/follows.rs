//! Database operations for the follow graph.

use crate::types::Follow;
use crate::{Error, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::PgPool;

/// Repository for follower→master edges.
#[derive(Clone)]
pub struct FollowRepository {
    pool: PgPool,
}

impl FollowRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create or reactivate a follow edge with the given copy settings.
    ///
    /// Self-follows are rejected; the unique constraint on
    /// (follower_id, following_id) prevents duplicate edges.
    pub async fn create(
        &self,
        follower_id: i64,
        following_id: i64,
        copy_percentage: Decimal,
        max_risk_per_trade: Decimal,
    ) -> Result<Follow> {
        if follower_id == following_id {
            return Err(Error::Validation("cannot follow yourself".to_string()));
        }

        let follow: Follow = sqlx::query_as(
            r#"
            INSERT INTO follows (
                follower_id, following_id, copy_percentage, max_risk_per_trade,
                is_active, created_at, total_copied_trades
            )
            VALUES ($1, $2, $3, $4, TRUE, $5, 0)
            ON CONFLICT (follower_id, following_id) DO UPDATE SET
                is_active = TRUE,
                copy_percentage = EXCLUDED.copy_percentage,
                max_risk_per_trade = EXCLUDED.max_risk_per_trade
            RETURNING *
            "#,
        )
        .bind(follower_id)
        .bind(following_id)
        .bind(copy_percentage)
        .bind(max_risk_per_trade)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(follow)
    }

    /// Deactivate the edge. Returns false when no active edge existed.
    pub async fn deactivate(&self, follower_id: i64, following_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE follows SET is_active = FALSE
            WHERE follower_id = $1 AND following_id = $2 AND is_active = TRUE
            "#,
        )
        .bind(follower_id)
        .bind(following_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn find_active(&self, follower_id: i64, following_id: i64) -> Result<Option<Follow>> {
        let follow = sqlx::query_as(
            "SELECT * FROM follows WHERE follower_id = $1 AND following_id = $2 AND is_active = TRUE",
        )
        .bind(follower_id)
        .bind(following_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(follow)
    }

    /// Active edges pointing at a master, i.e. everyone copying them.
    pub async fn active_followers_of(&self, master_id: i64) -> Result<Vec<Follow>> {
        let follows = sqlx::query_as(
            "SELECT * FROM follows WHERE following_id = $1 AND is_active = TRUE ORDER BY id",
        )
        .bind(master_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(follows)
    }

    /// Active edges held by a follower, i.e. every master they copy.
    pub async fn active_follows_for(&self, follower_id: i64) -> Result<Vec<Follow>> {
        let follows = sqlx::query_as(
            "SELECT * FROM follows WHERE follower_id = $1 AND is_active = TRUE ORDER BY id",
        )
        .bind(follower_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(follows)
    }

    pub async fn record_copied_trade(&self, follow_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE follows SET
                last_copied_trade = $1,
                total_copied_trades = total_copied_trades + 1
            WHERE id = $2
            "#,
        )
        .bind(Utc::now())
        .bind(follow_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
