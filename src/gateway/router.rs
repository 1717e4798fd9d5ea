//! HTTP router

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    http::{HeaderName, StatusCode},
    routing::{get, post},
};
use tower_http::{
    catch_panic::CatchPanicLayer,
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use super::auth::{AuthPipeline, gateway_handler};
use super::handlers::{health_handler, issue_handler, logout_handler, refresh_handler};
use super::upstream::Upstream;

const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Shared application state
pub struct AppState {
    /// Authorization pipeline (codec, blocklist, route table)
    pub pipeline: AuthPipeline,
    /// Where authorized requests go
    pub upstream: Arc<dyn Upstream>,
    /// Resolved admin bearer token for `POST /auth/token`
    pub admin_token: Option<String>,
}

/// Limits applied to every request.
#[derive(Debug, Clone, Copy)]
pub struct RouterLimits {
    /// Whole-request timeout
    pub request_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

/// Create the router
pub fn create_router(state: Arc<AppState>, limits: RouterLimits) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/auth/token", post(issue_handler))
        .route("/auth/refresh", post(refresh_handler))
        .route("/auth/logout", post(logout_handler))
        .fallback(gateway_handler)
        .layer(RequestBodyLimitLayer::new(limits.max_body_size))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            limits.request_timeout,
        ))
        .layer(CatchPanicLayer::new())
        .layer(PropagateRequestIdLayer::new(REQUEST_ID_HEADER))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(REQUEST_ID_HEADER, MakeRequestUuid))
        .with_state(state)
}
