//! HTTP request handlers.

use crate::middleware::RequestId;
use crate::response::{HealthResponse, PingResponse, RelayResponse};
use crate::schemas::RelayTransactionRequest;
use crate::server::RelayServer;
use axum::extract::{FromRequest, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use ethers::types::Address;
use serde::Deserialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Deserialize)]
pub struct PingQuery {
    #[serde(default)]
    pub paymaster: Option<Address>,
}

/// `GET /getaddr` - relay identity, fee floor and readiness.
pub async fn getaddr(
    State(server): State<Arc<RelayServer>>,
    Query(query): Query<PingQuery>,
) -> impl IntoResponse {
    if let Some(paymaster) = query.paymaster {
        if server.is_trusted_paymaster(paymaster) {
            info!(paymaster = ?paymaster, "ping from trusted paymaster");
        }
    }
    Json(PingResponse {
        relay_worker_address: format!("{:?}", server.worker_address()),
        relay_manager_address: format!("{:?}", server.manager_address()),
        relay_hub_address: format!("{:?}", server.hub_address()),
        min_gas_price: server.gas_price().to_string(),
        max_acceptance_budget: server.config.max_acceptance_budget.to_string(),
        chain_id: server.chain_id().to_string(),
        network_id: server.network_id().to_string(),
        ready: server.is_ready(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// `POST /relay` - validate and submit a signed relay request.
pub async fn relay(
    State(server): State<Arc<RelayServer>>,
    request_parts: axum::extract::Request,
) -> (StatusCode, Json<RelayResponse>) {
    server.request_count.fetch_add(1, Ordering::Relaxed);

    let req_id = request_parts
        .extensions()
        .get::<RequestId>()
        .map(|r| r.0.clone())
        .unwrap_or_default();

    // Shape errors are part of the admission contract: the reason goes back
    // to the client verbatim.
    let request: RelayTransactionRequest =
        match Json::<RelayTransactionRequest>::from_request(request_parts, &server).await {
            Ok(Json(request)) => request,
            Err(e) => {
                warn!(req_id = %req_id, error = %e, "malformed relay request");
                return (
                    StatusCode::BAD_REQUEST,
                    Json(RelayResponse::err(format!("invalid relay request: {e}"))),
                );
            }
        };

    match server.create_relay_transaction(request).await {
        Ok(signed_tx) => {
            info!(req_id = %req_id, "relay request accepted");
            (
                StatusCode::OK,
                Json(RelayResponse::ok(format!("0x{}", hex::encode(&signed_tx)))),
            )
        }
        Err(e) => {
            warn!(req_id = %req_id, error = %e, "relay request refused");
            (StatusCode::BAD_REQUEST, Json(RelayResponse::err(e.to_string())))
        }
    }
}

/// `GET /health` - liveness with basic metrics.
pub async fn health(State(server): State<Arc<RelayServer>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        relay_manager: format!("{:?}", server.manager_address()),
        relay_worker: format!("{:?}", server.worker_address()),
        uptime_secs: server.start_time.elapsed().as_secs(),
        requests: server.request_count.load(Ordering::Relaxed),
        ready: server.is_ready(),
        alerted: server.is_alerted(),
    })
}
