//! # relayd
//!
//! Off-chain relay server for a meta-transaction network. Accepts signed
//! relay requests over HTTP, validates them against on-chain constraints,
//! and submits them as its own transactions against a relay hub contract.
//!
//! The reconciliation loop keeps the server registered and funded: it scans
//! new blocks, drives the stake/authorize/register state machine, boosts
//! stuck transactions, prunes confirmed ones, replenishes the worker wallet
//! and gates the externally visible READY flag.
//!
//! ## Endpoints
//! - `GET /getaddr` - relay addresses, fee floor, readiness
//! - `POST /relay` - validate and submit a signed relay request
//! - `GET /health` - liveness with basic metrics

pub mod admission;
pub mod balance;
pub mod chain;
pub mod config;
mod error;
pub mod handlers;
pub mod keys;
mod middleware;
pub mod reconcile;
pub mod registration;
mod response;
mod router;
pub mod schemas;
pub mod server;
pub mod tx_manager;
pub mod tx_store;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::Config;
pub use error::Error;
pub use router::create as create_router;
pub use server::RelayServer;
