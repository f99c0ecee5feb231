//! HTTP router and middleware stack.

use crate::handlers;
use crate::middleware::inject_request_id;
use crate::server::RelayServer;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

const MAX_BODY_SIZE: usize = 1024 * 1024; // 1 MB
const MAX_CONCURRENT_RELAY: usize = 128;
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

pub fn create(server: Arc<RelayServer>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(Any);

    let relay_route = Router::new()
        .route("/relay", post(handlers::relay))
        .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_RELAY));

    let public_routes = Router::new()
        .route("/getaddr", get(handlers::getaddr))
        .route("/health", get(handlers::health));

    public_routes
        .merge(relay_route)
        .layer(middleware::from_fn(inject_request_id))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}
