//! Database operations for users.

use crate::types::User;
use crate::Result;
use chrono::Utc;
use sqlx::PgPool;

/// Repository for user records.
#[derive(Clone)]
pub struct UserRepository {
    pool: PgPool,
}

impl UserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a new user and return the created row.
    ///
    /// The api_key is assigned in a second step so the key can embed the real
    /// user id; see `set_api_key`.
    pub async fn create(&self, email: &str, username: &str, password_hash: &str) -> Result<User> {
        let user: User = sqlx::query_as(
            r#"
            INSERT INTO users (email, username, password_hash, is_active, is_online, is_master_trader, created_at)
            VALUES ($1, $2, $3, TRUE, FALSE, FALSE, $4)
            RETURNING *
            "#,
        )
        .bind(email)
        .bind(username)
        .bind(password_hash)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(user)
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<User>> {
        let user = sqlx::query_as("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    /// Case-insensitive email lookup.
    pub async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let user = sqlx::query_as("SELECT * FROM users WHERE LOWER(email) = LOWER($1)")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn find_by_username(&self, username: &str) -> Result<Option<User>> {
        let user = sqlx::query_as("SELECT * FROM users WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn find_by_api_key(&self, api_key: &str) -> Result<Option<User>> {
        let user = sqlx::query_as("SELECT * FROM users WHERE api_key = $1")
            .bind(api_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn api_key_exists(&self, api_key: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1::BIGINT FROM users WHERE api_key = $1")
            .bind(api_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Assign a freshly generated api key. The unique index on users.api_key
    /// is the write-time collision check; callers retry on violation.
    pub async fn set_api_key(&self, user_id: i64, api_key: &str) -> Result<()> {
        sqlx::query("UPDATE users SET api_key = $1 WHERE id = $2")
            .bind(api_key)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_master_trader(&self, user_id: i64, is_master: bool) -> Result<()> {
        sqlx::query("UPDATE users SET is_master_trader = $1 WHERE id = $2")
            .bind(is_master)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_online(&self, user_id: i64, is_online: bool) -> Result<()> {
        sqlx::query("UPDATE users SET is_online = $1, last_seen = $2 WHERE id = $3")
            .bind(is_online)
            .bind(Utc::now())
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_login(&self, user_id: i64) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE users SET is_online = TRUE, last_login = $1, last_seen = $1 WHERE id = $2",
        )
        .bind(now)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fix the ingestion source IP on first authenticated use.
    pub async fn bind_login_ip(&self, user_id: i64, ip: &str) -> Result<()> {
        sqlx::query("UPDATE users SET last_login_ip = $1 WHERE id = $2 AND last_login_ip IS NULL")
            .bind(ip)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn touch_last_seen(&self, user_id: i64) -> Result<()> {
        sqlx::query("UPDATE users SET last_seen = $1 WHERE id = $2")
            .bind(Utc::now())
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
