//! HTTP request handlers.

pub mod auth;
pub mod ea;
pub mod follows;
pub mod health;
pub mod marketplace;
pub mod trades;
pub mod users;
