//! Database access layer for PostgreSQL.

pub mod connections;
pub mod follows;
pub mod ledger;
pub mod trades;
pub mod users;

pub use connections::ConnectionRepository;
pub use follows::FollowRepository;
pub use ledger::CopyTradeLedger;
pub use trades::TradeStore;
pub use users::UserRepository;

use crate::config::DatabaseConfig;
use crate::Result;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// Create a PostgreSQL connection pool.
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .connect(&config.url)
        .await?;

    Ok(pool)
}
