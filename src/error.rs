//! Relay server error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::fmt;

#[derive(Debug, Clone)]
pub enum Error {
    /// Bad configuration or key material.
    Config(String),
    /// RPC or provider failure. Transient; retried on the next tick.
    Chain(String),
    /// A relay request failed one of the admission checks. The message is
    /// returned verbatim to the client.
    Validation(String),
    /// On-chain state contradicts this server's identity (foreign owner,
    /// hub not deployed). Fatal.
    Integrity(String),
    /// Transaction journal failure.
    Store(String),
    /// Signing failure.
    Signer(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "config error: {msg}"),
            Error::Chain(msg) => write!(f, "chain error: {msg}"),
            Error::Validation(msg) => write!(f, "{msg}"),
            Error::Integrity(msg) => write!(f, "integrity error: {msg}"),
            Error::Store(msg) => write!(f, "store error: {msg}"),
            Error::Signer(msg) => write!(f, "signer error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Validation failures carry their reason to the client; everything
        // else is collapsed to a generic message.
        let (status, public_msg) = match &self {
            Error::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Error::Chain(_) => (StatusCode::BAD_GATEWAY, "RPC communication error".to_string()),
            Error::Config(_) | Error::Integrity(_) | Error::Store(_) | Error::Signer(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal relay error".to_string(),
            ),
        };
        let body = serde_json::json!({ "error": public_msg });
        (status, Json(body)).into_response()
    }
}
