//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, info};

use super::auth::AuthGate;
use super::registry::SessionRegistry;
use crate::config::TransportConfig;
use crate::session::SESSION_HEADER;
use crate::transport::SessionTransport;

/// Shared application state
pub struct AppState {
    /// Live sessions
    pub registry: Arc<SessionRegistry>,
    /// Credential check for POST, GET and DELETE
    pub auth: AuthGate,
}

/// Create the router
pub fn create_router(state: Arc<AppState>, max_body_size: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/",
            get(sse_handler)
                .post(post_handler)
                .delete(delete_handler)
                .options(preflight_handler),
        )
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn session_id(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|id| !id.is_empty())
}

/// POST / - JSON-RPC request or notification
async fn post_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // Check credentials before a session can be created for the caller.
    if !state.auth.validate(&headers) {
        return AuthGate::unauthorized_response();
    }

    let transport = state.registry.get_or_create(session_id(&headers));
    transport.handle_post_request(&headers, &body, None).await
}

/// GET / - SSE stream for server-to-client messages
async fn sse_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !state.auth.validate(&headers) {
        return AuthGate::unauthorized_response();
    }

    let transport = match session_id(&headers) {
        Some(id) => state.registry.get_or_create(Some(id)),
        // Anonymous transport; answers 400 without touching the registry.
        None => SessionTransport::new(None, TransportConfig::default()),
    };
    transport.handle_get_request(Some(&headers), None)
}

/// DELETE / - session termination
async fn delete_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !state.auth.validate(&headers) {
        return AuthGate::unauthorized_response();
    }

    match session_id(&headers) {
        Some(id) if state.registry.close(id) => {
            info!(session_id = %id, "Session terminated by client");
            StatusCode::NO_CONTENT.into_response()
        }
        Some(id) => {
            debug!(session_id = %id, "Session not found for DELETE");
            StatusCode::NOT_FOUND.into_response()
        }
        None => StatusCode::BAD_REQUEST.into_response(),
    }
}

/// OPTIONS / - CORS preflight
async fn preflight_handler(State(state): State<Arc<AppState>>) -> Response {
    let allow_headers = format!(
        "Content-Type, Cache-Control, {SESSION_HEADER}, Authorization, {}",
        state.auth.header_name()
    );
    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, DELETE, OPTIONS"),
    );
    if let Ok(value) = HeaderValue::from_str(&allow_headers) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, value);
    }
    headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
    response
}

/// GET /health - liveness, no authentication
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.registry.len(),
    }))
}
