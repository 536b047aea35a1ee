//! Application state shared across handlers.

use auth::{ApiKeyCache, AuditLogger, SessionStore};
use relay_core::db::{
    ConnectionRepository, CopyTradeLedger, FollowRepository, TradeStore, UserRepository,
};
use replication::{Backfill, EventBus, IngestionReconciler, ReplicationEngine};
use sqlx::PgPool;
use std::sync::Arc;

use crate::websocket::SessionHub;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: PgPool,
    /// User records.
    pub users: UserRepository,
    /// Trade store.
    pub trades: TradeStore,
    /// Follow graph.
    pub follows: FollowRepository,
    /// Copy-trade ledger.
    pub ledger: CopyTradeLedger,
    /// Cached terminal connections.
    pub connections: ConnectionRepository,
    /// Client session hub (UI + command channels).
    pub hub: Arc<SessionHub>,
    /// Domain event queue between ingestion and replication.
    pub events: EventBus,
    /// Ingestion reconciler.
    pub reconciler: Arc<IngestionReconciler>,
    /// Replication engine (also the confirmation sink).
    pub engine: Arc<ReplicationEngine>,
    /// Backfill on follower connect.
    pub backfill: Arc<Backfill>,
    /// Process-local api_key → user cache.
    pub api_keys: Arc<ApiKeyCache>,
    /// Active web sessions.
    pub sessions: Arc<SessionStore>,
    /// Audit logger.
    pub audit: Arc<AuditLogger>,
}

impl AppState {
    /// Create a new application state and wire the replication runtime.
    pub fn new(pool: PgPool, ws_channel_capacity: usize) -> Self {
        let hub = Arc::new(SessionHub::new());
        let events = EventBus::new(ws_channel_capacity);

        let reconciler = Arc::new(IngestionReconciler::new(
            pool.clone(),
            hub.clone(),
            events.clone(),
        ));
        let engine = Arc::new(ReplicationEngine::new(
            pool.clone(),
            hub.clone(),
            events.clone(),
        ));
        let backfill = Arc::new(Backfill::new(pool.clone(), events.clone()));

        Self {
            users: UserRepository::new(pool.clone()),
            trades: TradeStore::new(pool.clone()),
            follows: FollowRepository::new(pool.clone()),
            ledger: CopyTradeLedger::new(pool.clone()),
            connections: ConnectionRepository::new(pool.clone()),
            pool,
            hub,
            events,
            reconciler,
            engine,
            backfill,
            api_keys: Arc::new(ApiKeyCache::new()),
            sessions: Arc::new(SessionStore::new()),
            audit: Arc::new(AuditLogger::new()),
        }
    }

    /// Create an Arc-wrapped state.
    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }
}
