//! API response types.

use serde::Serialize;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_tx: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RelayResponse {
    pub fn ok(signed_tx: String) -> Self {
        Self {
            signed_tx: Some(signed_tx),
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            signed_tx: None,
            error: Some(error.into()),
        }
    }
}

/// Answer to `GET /getaddr`: everything a client needs to target this relay.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResponse {
    pub relay_worker_address: String,
    pub relay_manager_address: String,
    pub relay_hub_address: String,
    pub min_gas_price: String,
    pub max_acceptance_budget: String,
    pub chain_id: String,
    pub network_id: String,
    pub ready: bool,
    pub version: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub relay_manager: String,
    pub relay_worker: String,
    pub uptime_secs: u64,
    pub requests: u64,
    pub ready: bool,
    pub alerted: bool,
}
