//! API Server
//!
//! HTTP and WebSocket surface of the copyrelay platform.
//!
//! # Features
//!
//! - **Ingestion**: authenticated snapshot intake from desktop clients
//! - **Replication runtime**: reconciler, engine, and backfill wired over an
//!   in-process event bus
//! - **Duplex channels**: per-user command channel and UI push channel
//! - **OpenAPI**: auto-generated Swagger documentation
//!
//! # Example
//!
//! ```ignore
//! use api_server::{ApiServer, ServerConfig};
//!
//! let config = ServerConfig::from_env();
//! let server = ApiServer::new(config, pool).await?;
//! server.run().await?;
//! ```

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod websocket;

pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;

use axum::extract::DefaultBodyLimit;
use axum::http::Request;
use sqlx::PgPool;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

/// Heartbeat cadence for every attached channel.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Enable CORS for all origins (development only).
    pub cors_permissive: bool,
    /// Domain event queue capacity.
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            cors_permissive: true,
            event_capacity: 1024,
        }
    }
}

impl ServerConfig {
    /// Create from environment variables.
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .or_else(|_| std::env::var("API_PORT"))
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8000),
            cors_permissive: std::env::var("CORS_PERMISSIVE")
                .map(|v| v == "true")
                .unwrap_or(true),
            event_capacity: std::env::var("EVENT_QUEUE_CAPACITY")
                .ok()
                .and_then(|c| c.parse().ok())
                .unwrap_or(1024),
        }
    }

    /// Get the socket address.
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

/// The API server.
pub struct ApiServer {
    config: ServerConfig,
    state: AppState,
}

impl ApiServer {
    /// Create a new API server.
    pub async fn new(config: ServerConfig, pool: PgPool) -> anyhow::Result<Self> {
        let state = AppState::new(pool, config.event_capacity);
        Ok(Self { config, state })
    }

    /// Run the server.
    pub async fn run(self) -> anyhow::Result<()> {
        let state = self.state.into_arc();

        // The replication engine consumes domain events for the life of the
        // process.
        let engine = state.engine.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.run().await {
                tracing::error!(error = %e, "Replication engine stopped");
            }
        });

        // Heartbeat every attached channel; dead ones detach on failure.
        let hub = state.hub.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                interval.tick().await;
                hub.heartbeat();
            }
        });

        let router = create_router(state.clone());
        let router = router
            .layer(
                TraceLayer::new_for_http()
                    .on_request(|request: &Request<_>, _span: &tracing::Span| {
                        tracing::debug!(
                            method = %request.method(),
                            uri = %request.uri(),
                            "Incoming request"
                        );
                    })
                    .on_response(DefaultOnResponse::new().level(Level::DEBUG))
                    .on_failure(
                        |error: tower_http::classify::ServerErrorsFailureClass,
                         latency: std::time::Duration,
                         _span: &tracing::Span| {
                            tracing::error!(
                                error = %error,
                                latency_ms = latency.as_millis(),
                                "Request failed"
                            );
                        },
                    ),
            )
            .layer(DefaultBodyLimit::max(2 * 1024 * 1024)) // 2 MB
            .layer(if self.config.cors_permissive {
                CorsLayer::permissive()
            } else {
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any)
            });

        let addr = self.config.socket_addr()?;
        info!(address = %addr, "Starting API server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;

        Ok(())
    }
}
