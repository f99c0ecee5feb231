//! Reconciliation loop.
//!
//! One cooperative tick per interval: observe the latest block, refresh gas
//! price and balances, fold in hub events, boost stuck transactions, prune
//! confirmed ones, replenish the worker and settle the READY flag. A tick
//! never propagates errors to its caller; failures are logged, emitted on the
//! event stream and reset the success-round counter.

use crate::chain::{calls, HubEventKind};
use crate::error::Error;
use crate::server::{RelayServer, ServerEvent};
use crate::tx_manager::{mul_factor, SendTransactionDetails};
use crate::tx_store::ServerAction;
use ethers::types::{Bytes, H256, U256};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Gas limit of a plain value transfer.
const VALUE_TRANSFER_GAS: u64 = 21_000;

impl RelayServer {
    /// Drive the periodic tick until `stop` flips. The in-progress tick is
    /// awaited inline, so shutdown drains it naturally.
    pub async fn run(self: std::sync::Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.check_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = stop.changed() => {
                    info!("reconciliation loop stopping");
                    return;
                }
            }
            // Outside the select so shutdown drains the in-flight tick
            // instead of cancelling it.
            self.tick().await;
            if *stop.borrow() {
                info!("reconciliation loop stopping");
                return;
            }
        }
    }

    /// Soft watchdog: when no tick completes within `ready_timeout_ms`, zero
    /// the success-round counter and de-ready. The long-running call itself
    /// is never cancelled; aborting a broadcast mid-flight could corrupt
    /// nonce bookkeeping.
    pub async fn run_watchdog(self: std::sync::Arc<Self>, mut stop: watch::Receiver<bool>) {
        let timeout = Duration::from_millis(self.config.ready_timeout_ms);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    let stale = self.last_tick_at.lock().unwrap().elapsed() > timeout;
                    if stale {
                        warn!("no completed reconciliation round within ready timeout");
                        self.reset_rounds();
                    }
                }
                _ = stop.changed() => return,
            }
        }
    }

    /// One guarded tick. A tick arriving while another runs is skipped, not
    /// queued.
    pub async fn tick(&self) {
        if self
            .tick_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("previous reconciliation tick still in progress, skipping");
            return;
        }

        if let Err(e) = self.tick_inner().await {
            error!(error = %e, "reconciliation tick failed");
            self.emit(ServerEvent::TickError(e.to_string()));
            self.set_ready(false);
        }

        *self.last_tick_at.lock().unwrap() = Instant::now();
        self.tick_in_progress.store(false, Ordering::SeqCst);
    }

    async fn tick_inner(&self) -> Result<(), Error> {
        let block = self.chain.block_number().await?;
        let last_scanned = self.last_scanned_block.load(Ordering::SeqCst);
        if block <= last_scanned {
            debug!(block, "no new block, nothing to reconcile");
            return Ok(());
        }

        let last_refresh = self.last_refresh_block.load(Ordering::SeqCst);
        let skip_refresh = block.saturating_sub(last_refresh)
            < self.config.refresh_state_timeout_blocks
            && self.is_ready();

        let mut events = Vec::new();
        if !skip_refresh {
            let network_price = self.chain.gas_price().await?;
            let price = mul_factor(network_price, self.config.gas_price_factor);
            if price.is_zero() {
                return Err(Error::Chain("network gas price is zero".into()));
            }
            self.set_gas_price(price);

            if !self.registration.refresh_balance().await? {
                self.set_ready(false);
                return Ok(());
            }

            events = self
                .chain
                .hub_events(self.manager, last_scanned + 1, block)
                .await?;
            let should_register_again = self.registration.should_register_again(block);
            self.registration
                .handle_past_events(&events, block, self.gas_price(), should_register_again)
                .await?;

            self.tx_manager.remove_confirmed_transactions(block).await?;
            for signer in [self.manager, self.worker] {
                // Boosting is best-effort within the tick.
                if let Err(e) = self
                    .tx_manager
                    .boost_oldest_pending_transaction_for_signer(signer, block)
                    .await
                {
                    warn!(signer = ?signer, error = %e, "boost attempt failed");
                }
            }
            self.last_refresh_block.store(block, Ordering::SeqCst);
        }

        self.replenish(block).await?;
        self.last_scanned_block.store(block, Ordering::SeqCst);

        let worker_balance = self.chain.balance(self.worker).await?;
        let funded = worker_balance >= U256::from(self.config.worker_min_balance);
        self.set_ready(self.registration.is_registered() && funded);

        {
            let mut alerted = self.alerted_block.lock().unwrap();
            if let Some(alerted_at) = *alerted {
                if alerted_at + self.config.alerted_block_delay < block {
                    info!(block, "alerted state cleared");
                    *alerted = None;
                }
            }
        }
        if events
            .iter()
            .any(|e| e.kind == HubEventKind::TransactionRejectedByPaymaster)
        {
            self.enter_alerted(block);
        }
        Ok(())
    }

    /// Keep the worker funded out of the manager's wallet, topping the
    /// manager up from its hub deposit first. All replenishment transactions
    /// go through the standard send path, so they are journaled and
    /// boostable.
    pub(crate) async fn replenish(&self, block: u64) -> Result<Vec<H256>, Error> {
        let mut submitted = Vec::new();

        let manager_eth = self.chain.balance(self.manager).await?;
        let manager_hub = self.chain.hub_balance_of(self.manager).await?;
        if manager_eth < U256::from(self.config.manager_target_balance)
            && manager_hub >= U256::from(self.config.min_hub_withdrawal_balance)
            && !self
                .store
                .is_action_pending(ServerAction::DepositWithdrawal, Some(self.manager))?
        {
            let data = calls::withdraw(manager_hub, self.manager);
            let gas_limit = self
                .tx_manager
                .attempt_estimate_gas("withdraw", self.manager, self.hub, data.clone())
                .await?;
            let (tx_hash, _) = self
                .tx_manager
                .send_transaction(SendTransactionDetails {
                    signer: self.manager,
                    action: ServerAction::DepositWithdrawal,
                    to: self.hub,
                    value: U256::zero(),
                    gas_limit,
                    gas_price: self.gas_price(),
                    data,
                    creation_block_number: block,
                })
                .await?;
            info!(amount = %manager_hub, tx_hash = ?tx_hash, "withdrawing hub deposit to manager");
            submitted.push(tx_hash);
        }

        let manager_eth = self.chain.balance(self.manager).await?;
        let worker_balance = self.chain.balance(self.worker).await?;
        if worker_balance < U256::from(self.config.worker_min_balance) {
            let transfer_pending = self.store.all_by_signer(self.manager)?.iter().any(|tx| {
                !tx.is_mined()
                    && tx.server_action == ServerAction::ValueTransfer
                    && tx.to == self.worker
            });
            if !transfer_pending {
                let refill =
                    U256::from(self.config.worker_target_balance).saturating_sub(worker_balance);
                let spendable =
                    manager_eth.saturating_sub(U256::from(self.config.manager_min_balance));
                if refill < spendable {
                    let (tx_hash, _) = self
                        .tx_manager
                        .send_transaction(SendTransactionDetails {
                            signer: self.manager,
                            action: ServerAction::ValueTransfer,
                            to: self.worker,
                            value: refill,
                            gas_limit: U256::from(VALUE_TRANSFER_GAS),
                            gas_price: self.gas_price(),
                            data: Bytes::new(),
                            creation_block_number: block,
                        })
                        .await?;
                    info!(refill = %refill, tx_hash = ?tx_hash, "replenishing worker from manager");
                    submitted.push(tx_hash);
                } else {
                    let message = format!(
                        "relay manager {:?} balance {manager_eth} cannot cover worker {:?} refill of {refill}",
                        self.manager, self.worker
                    );
                    error!("{message}");
                    self.emit(ServerEvent::FundingNeeded(message));
                }
            }
        }
        Ok(submitted)
    }
}
