//! Authentication middleware for the web API.

use axum::{
    body::Body,
    extract::State,
    http::{header::AUTHORIZATION, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

use crate::error::ErrorResponse;
use crate::state::AppState;

/// Extract and validate the bearer session token.
/// On success, injects the authenticated `User` into request extensions.
pub async fn require_session(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let auth_header = match request.headers().get(AUTHORIZATION) {
        Some(header) => match header.to_str() {
            Ok(s) => s,
            Err(_) => {
                return unauthorized_response("Invalid authorization header encoding");
            }
        },
        None => {
            return unauthorized_response("Missing authorization header");
        }
    };

    let token = match auth_header.strip_prefix("Bearer ") {
        Some(t) => t,
        None => {
            return unauthorized_response("Invalid authorization format, expected 'Bearer <token>'");
        }
    };

    let user_id = match state.sessions.resolve(token) {
        Some(id) => id,
        None => {
            return unauthorized_response("Invalid or expired session token");
        }
    };

    let user = match state.users.find_by_id(user_id).await {
        Ok(Some(user)) if user.is_active => user,
        Ok(_) => {
            return unauthorized_response("Account is not active");
        }
        Err(e) => {
            tracing::error!(error = %e, "Session user lookup failed");
            return internal_response();
        }
    };

    tracing::debug!(user_id = user.id, "Authenticated request");
    request.extensions_mut().insert(user);

    next.run(request).await
}

/// Helper to create an unauthorized (401) response.
fn unauthorized_response(detail: &str) -> Response {
    let body = ErrorResponse::new("UNAUTHORIZED", detail);
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}

fn internal_response() -> Response {
    let body = ErrorResponse::new("INTERNAL_ERROR", "Internal server error");
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unauthorized_response_status() {
        let response = unauthorized_response("Test message");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
