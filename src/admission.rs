//! Admission pipeline.
//!
//! Validates a relay request against this server's identity, fee terms and
//! the paymaster's on-hub funding, simulates the call, and only then signs
//! and broadcasts. Every check is fatal with a descriptive reason; a request
//! that fails validation never reaches the transaction manager.

use crate::chain::{calls, PaymasterGasLimits, RelayFees};
use crate::error::Error;
use crate::schemas::RelayTransactionRequest;
use crate::server::RelayServer;
use crate::tx_manager::SendTransactionDetails;
use crate::tx_store::ServerAction;
use ethers::types::{Bytes, U256};
use rand::Rng;
use std::time::Duration;
use tracing::{info, warn};

/// Gas kept aside for the hub's own bookkeeping around the relayed call.
const GAS_RESERVE: u64 = 100_000;

impl RelayServer {
    /// Validate and submit a relay request. Returns the raw signed
    /// transaction on success.
    pub async fn create_relay_transaction(
        &self,
        request: RelayTransactionRequest,
    ) -> Result<Bytes, Error> {
        if !self.is_ready() {
            return Err(Error::Validation("relay not ready".into()));
        }

        let relay_data = &request.relay_request.relay_data;
        let paymaster = relay_data.paymaster;
        let trusted = self.is_trusted_paymaster(paymaster);

        // Hub address.
        if request.metadata.relay_hub_address != self.hub {
            return Err(Error::Validation(format!(
                "Wrong hub address: request {:?}, server {:?}",
                request.metadata.relay_hub_address, self.hub
            )));
        }

        // Worker address.
        if relay_data.relay_worker != self.worker {
            return Err(Error::Validation(format!(
                "Wrong worker address: request {:?}, server {:?}",
                relay_data.relay_worker, self.worker
            )));
        }

        // Gas price floor.
        let min_gas_price = self.gas_price();
        if relay_data.gas_price < min_gas_price {
            return Err(Error::Validation(format!(
                "gas price too low: request {}, relay minimum {min_gas_price}",
                relay_data.gas_price
            )));
        }

        // Fee floor, bypassed for trusted paymasters.
        if !trusted {
            if relay_data.pct_relay_fee < U256::from(self.config.pct_relay_fee) {
                return Err(Error::Validation(format!(
                    "pctRelayFee too low: request {}, relay minimum {}",
                    relay_data.pct_relay_fee, self.config.pct_relay_fee
                )));
            }
            if relay_data.base_relay_fee < U256::from(self.config.base_relay_fee) {
                return Err(Error::Validation(format!(
                    "baseRelayFee too low: request {}, relay minimum {}",
                    relay_data.base_relay_fee, self.config.base_relay_fee
                )));
            }
        }

        // Nonce horizon: the client signed over a maximum worker nonce.
        let next_nonce = self.tx_manager.poll_nonce(self.worker).await?;
        if next_nonce > request.metadata.relay_max_nonce {
            return Err(Error::Validation(format!(
                "relay worker nonce {next_nonce} exceeds relayMaxNonce {}",
                request.metadata.relay_max_nonce
            )));
        }

        // Paymaster gas limits; untrusted paymasters are capped.
        let limits = self.paymaster_limits(paymaster, trusted).await?;
        if !trusted && limits.acceptance_budget > U256::from(self.config.max_acceptance_budget) {
            return Err(Error::Validation(format!(
                "paymaster acceptance budget {} exceeds relay maximum {}",
                limits.acceptance_budget, self.config.max_acceptance_budget
            )));
        }

        // The paymaster must be able to pay for the worst case.
        let max_possible_gas = U256::from(GAS_RESERVE)
            + U256::from(self.config.hub_overhead_gas)
            + limits.pre_relayed_call_gas_limit
            + request.relay_request.request.gas
            + limits.post_relayed_call_gas_limit;
        let fees = RelayFees {
            pct_relay_fee: relay_data.pct_relay_fee,
            base_relay_fee: relay_data.base_relay_fee,
        };
        let max_charge = self
            .chain
            .hub_max_charge(max_possible_gas, relay_data.gas_price, &fees)
            .await?;
        let paymaster_balance = self.chain.hub_balance_of(paymaster).await?;
        if paymaster_balance < max_charge {
            return Err(Error::Validation(format!(
                "paymaster balance too low: {paymaster_balance}, maximum charge: {max_charge}"
            )));
        }

        // Dry-run from the worker; the paymaster must accept.
        let view = self
            .chain
            .simulate_relay_call(self.worker, &request, limits.acceptance_budget, max_possible_gas)
            .await?;
        if !view.paymaster_accepted {
            return Err(Error::Validation(format!(
                "paymaster rejected in view call: {}",
                view.reason()
            )));
        }

        // All checks passed: sign and broadcast from the worker.
        let current_block = self.chain.block_number().await?;
        let data = calls::relay_call(limits.acceptance_budget, &request, max_possible_gas);
        let (tx_hash, signed_tx) = self
            .tx_manager
            .send_transaction(SendTransactionDetails {
                signer: self.worker,
                action: ServerAction::RelayCall,
                to: self.hub,
                value: U256::zero(),
                gas_limit: max_possible_gas,
                gas_price: relay_data.gas_price,
                data,
                creation_block_number: current_block,
            })
            .await?;
        info!(tx_hash = ?tx_hash, paymaster = ?paymaster, "relay request submitted");

        // Submitting may have drained the worker below its floor.
        if let Err(e) = self.replenish(current_block).await {
            warn!(error = %e, "post-submit replenish check failed");
        }

        self.alerted_delay().await;
        Ok(signed_tx)
    }

    async fn paymaster_limits(
        &self,
        paymaster: ethers::types::Address,
        trusted: bool,
    ) -> Result<PaymasterGasLimits, Error> {
        if trusted {
            if let Some(limits) = self.trusted_limits.lock().unwrap().get(&paymaster) {
                return Ok(*limits);
            }
        }
        let limits = self.chain.paymaster_gas_limits(paymaster).await?;
        if trusted {
            self.trusted_limits.lock().unwrap().insert(paymaster, limits);
        }
        Ok(limits)
    }

    /// Under alert, stall the response by a uniformly random delay so probes
    /// cannot time the relay's behavior.
    async fn alerted_delay(&self) {
        if !self.is_alerted() {
            return;
        }
        let (min, max) = (
            self.config.min_alerted_delay_ms,
            self.config.max_alerted_delay_ms,
        );
        if max == 0 || max < min {
            return;
        }
        let delay = rand::thread_rng().gen_range(min..=max);
        info!(delay_ms = delay, "alerted: delaying relay response");
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{sample_relay_request, test_server};
    use crate::tx_store::TxStore;
    use ethers::types::Address;
    use std::sync::Arc;

    const ETH: u128 = 1_000_000_000_000_000_000;

    /// A server that has already converged to READY.
    async fn ready_server(
        mutate: impl FnOnce(&mut crate::config::Config),
    ) -> (
        Arc<crate::server::RelayServer>,
        Arc<crate::testutil::MockChain>,
        Arc<crate::testutil::MemTxStore>,
    ) {
        let (server, chain, store) = test_server(|c| {
            c.successful_rounds_for_ready = 0;
            mutate(c);
        })
        .await;
        chain.set_hub_balance(
            Address::repeat_byte(0x44),
            U256::from(1_000_000 * ETH),
        );
        server.set_ready(true);
        // Give the paymaster and worker generous defaults; tests override.
        chain.set_balance(server.worker_address(), U256::from(ETH));
        chain.set_balance(server.manager_address(), U256::from(ETH));
        (server, chain, store)
    }

    fn request_for(
        server: &crate::server::RelayServer,
    ) -> RelayTransactionRequest {
        sample_relay_request(
            server.hub_address(),
            server.worker_address(),
            Address::repeat_byte(0x44),
            U256::from(100u64),
        )
    }

    #[tokio::test]
    async fn rejects_when_not_ready() {
        let (server, chain, _) = test_server(|_| {}).await;
        let request = request_for(&server);
        let err = server.create_relay_transaction(request).await.unwrap_err();
        assert!(err.to_string().contains("not ready"));
        assert_eq!(chain.sent_count(), 0);
    }

    #[tokio::test]
    async fn rejects_wrong_hub_without_submission() {
        let (server, chain, store) = ready_server(|_| {}).await;
        let mut request = request_for(&server);
        request.metadata.relay_hub_address = Address::repeat_byte(0xaa);

        let err = server.create_relay_transaction(request).await.unwrap_err();
        assert!(err.to_string().starts_with("Wrong hub address"));
        assert_eq!(chain.sent_count(), 0);
        assert!(store.all_by_signer(server.worker_address()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_wrong_worker() {
        let (server, chain, _) = ready_server(|_| {}).await;
        let mut request = request_for(&server);
        request.relay_request.relay_data.relay_worker = Address::repeat_byte(0xbb);

        let err = server.create_relay_transaction(request).await.unwrap_err();
        assert!(err.to_string().starts_with("Wrong worker address"));
        assert_eq!(chain.sent_count(), 0);
    }

    #[tokio::test]
    async fn rejects_low_gas_price() {
        let (server, chain, _) = ready_server(|_| {}).await;
        server.set_gas_price(U256::from(1_000u64));
        let request = request_for(&server); // offers 100

        let err = server.create_relay_transaction(request).await.unwrap_err();
        assert!(err.to_string().contains("gas price too low"));
        assert_eq!(chain.sent_count(), 0);
    }

    #[tokio::test]
    async fn rejects_low_fees_unless_trusted() {
        let trusted_paymaster = Address::repeat_byte(0x44);
        let (server, chain, _) = ready_server(|c| c.pct_relay_fee = 70).await;
        let request = request_for(&server); // offers pct fee 10

        let err = server
            .create_relay_transaction(request.clone())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("pctRelayFee too low"));
        assert_eq!(chain.sent_count(), 0);

        // Same request sails through when the paymaster is trusted.
        let (server, chain, _) = ready_server(|c| {
            c.pct_relay_fee = 70;
            c.trusted_paymasters = vec![trusted_paymaster];
        })
        .await;
        let request = request_for(&server);
        server.create_relay_transaction(request).await.unwrap();
        assert_eq!(chain.sent_count(), 1);
    }

    #[tokio::test]
    async fn rejects_exceeded_nonce_horizon() {
        let (server, chain, _) = ready_server(|_| {}).await;
        chain.set_pending_nonce(server.worker_address(), 50);
        let mut request = request_for(&server);
        request.metadata.relay_max_nonce = 49;

        let err = server.create_relay_transaction(request).await.unwrap_err();
        assert!(err.to_string().contains("relayMaxNonce"));
        assert_eq!(chain.sent_count(), 0);
    }

    #[tokio::test]
    async fn rejects_oversized_acceptance_budget() {
        let (server, chain, _) = ready_server(|c| c.max_acceptance_budget = 50_000).await;
        // Mock default budget is 100_000.
        let request = request_for(&server);

        let err = server.create_relay_transaction(request).await.unwrap_err();
        assert!(err.to_string().contains("acceptance budget"));
        assert_eq!(chain.sent_count(), 0);
    }

    #[tokio::test]
    async fn rejects_underfunded_paymaster() {
        let (server, chain, _) = ready_server(|_| {}).await;
        chain.set_hub_balance(Address::repeat_byte(0x44), U256::from(10_000_000u64));
        let request = request_for(&server);

        let err = server.create_relay_transaction(request).await.unwrap_err();
        assert!(err.to_string().contains("paymaster balance too low"));
        assert_eq!(chain.sent_count(), 0);
    }

    #[tokio::test]
    async fn rejects_view_call_refusal() {
        let (server, chain, _) = ready_server(|_| {}).await;
        chain.set_relay_call_result(false, "nonce mismatch");
        let request = request_for(&server);

        let err = server.create_relay_transaction(request).await.unwrap_err();
        assert!(err
            .to_string()
            .contains("paymaster rejected in view call: nonce mismatch"));
        assert_eq!(chain.sent_count(), 0);
    }

    #[tokio::test]
    async fn accepted_request_is_signed_and_journaled() {
        let (server, chain, store) = ready_server(|_| {}).await;
        let request = request_for(&server);

        let signed = server.create_relay_transaction(request).await.unwrap();
        assert!(!signed.is_empty());
        assert_eq!(chain.sent_count(), 1);

        let journal = store.all_by_signer(server.worker_address()).unwrap();
        assert_eq!(journal.len(), 1);
        assert_eq!(journal[0].server_action, ServerAction::RelayCall);
        assert_eq!(journal[0].to, server.hub_address());
        assert_eq!(journal[0].nonce, 0);
    }
}
