//! API route definitions.

use axum::middleware as axum_middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::handlers::{auth, ea, follows, health, marketplace, trades, users};
use crate::middleware::require_session;
use crate::state::AppState;
use crate::websocket;

/// OpenAPI documentation.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Copyrelay API",
        version = "1.0.0",
        description = "Copy-trading broker: ingestion, replication, and account APIs"
    ),
    paths(
        health::health_check,
        auth::register,
        auth::login,
        auth::logout,
        ea::ea_data,
        trades::list_trades,
        trades::account_stats,
        trades::mt5_status,
        follows::follow_master,
        follows::unfollow_master,
        marketplace::list_traders,
        users::profile,
        users::set_master_trader,
        users::regenerate_api_key,
    ),
    components(
        schemas(
            crate::error::ErrorResponse,
            health::HealthResponse,
            auth::RegisterRequest,
            auth::LoginRequest,
            auth::AuthResponse,
            auth::UserInfo,
            auth::LogoutResponse,
            ea::EaDataRequest,
            ea::EaDataResponse,
            trades::TradeResponse,
            trades::TradeListResponse,
            trades::AccountStatsResponse,
            trades::Mt5StatusResponse,
            follows::FollowRequest,
            follows::FollowResponse,
            follows::UnfollowResponse,
            marketplace::TraderSummary,
            marketplace::TraderListResponse,
            users::ProfileResponse,
            users::MasterTraderRequest,
            users::MasterTraderResponse,
            users::RegenerateKeyResponse,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "auth", description = "Registration, login, and sessions"),
        (name = "ingestion", description = "Desktop client data ingestion"),
        (name = "trades", description = "Trade and account reads"),
        (name = "follows", description = "Follow graph management"),
        (name = "marketplace", description = "Master trader discovery"),
        (name = "users", description = "Profile and api key management"),
    )
)]
pub struct ApiDoc;

/// Create the main router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    // Rate limiter for auth endpoints: 5 requests per 60 seconds per IP.
    // SmartIpKeyExtractor honours X-Forwarded-For behind a proxy.
    let auth_rate_limit_config = GovernorConfigBuilder::default()
        .per_second(60)
        .burst_size(5)
        .key_extractor(SmartIpKeyExtractor)
        .finish()
        .expect("Failed to create auth rate limiter config");

    let auth_routes = Router::new()
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .layer(GovernorLayer::new(Arc::new(auth_rate_limit_config)));

    // Public routes: health, ingestion (api key travels in the body), the
    // duplex channels, and the tombstones for the removed session endpoints.
    let public_routes = Router::new()
        .route("/health", get(health::health_check))
        .route("/api/health", get(health::health_check))
        .route("/api/ea/data", post(ea::ea_data))
        .route("/ws/client/{user_id}", get(websocket::ws_client_handler))
        .route("/ws/user/{user_id}", get(websocket::ws_user_handler))
        // Deprecated cookie-session surface: permanently gone.
        .route("/api/auth/session", get(auth::session_gone))
        .route("/api/data/upload", post(auth::session_gone));

    // Everything else requires a bearer session.
    let protected_routes = Router::new()
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/trades", get(trades::list_trades))
        .route("/api/account/stats", get(trades::account_stats))
        .route("/api/mt5/status", get(trades::mt5_status))
        .route("/api/user/profile", get(users::profile))
        .route("/api/user/master-trader", post(users::set_master_trader))
        .route(
            "/api/user/regenerate-api-key",
            post(users::regenerate_api_key),
        )
        .route("/api/follow/{master_id}", post(follows::follow_master))
        .route(
            "/api/unfollow/{master_id}",
            delete(follows::unfollow_master),
        )
        .route("/api/marketplace/traders", get(marketplace::list_traders))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            require_session,
        ));

    Router::new()
        .merge(auth_routes)
        .merge(public_routes)
        .merge(protected_routes)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_spec() {
        let doc = ApiDoc::openapi();
        let json = doc.to_json().unwrap();
        assert!(json.contains("Copyrelay API"));
        assert!(json.contains("/api/ea/data"));
        assert!(json.contains("/api/follow/{master_id}"));
        assert!(json.contains("/api/marketplace/traders"));
    }
}
