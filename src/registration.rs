//! Registration manager.
//!
//! Drives the relay manager through the on-chain states required to serve
//! traffic: stake, authorize the hub, add the worker, register. Each tick it
//! refreshes the on-chain view, folds in the events since the last scan, and
//! emits at most the next missing transition as a signed transaction.

use crate::balance::AmountRequired;
use crate::chain::{calls, ChainAccess, HubEvent, HubEventKind};
use crate::config::Config;
use crate::error::Error;
use crate::tx_manager::{SendTransactionDetails, TransactionManager};
use crate::tx_store::ServerAction;
use ethers::types::{Address, Bytes, H256, U256};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

/// In-memory mirror of the manager's on-chain registration state.
#[derive(Debug, Clone, Default)]
pub struct RegistrationState {
    pub owner: Option<Address>,
    pub stake: U256,
    pub unstake_delay: U256,
    pub withdraw_block: Option<u64>,
    pub staked: bool,
    pub hub_authorized: bool,
    pub worker_added: bool,
    pub registered: bool,
}

pub struct RegistrationManager {
    chain: Arc<dyn ChainAccess>,
    tx_manager: Arc<TransactionManager>,
    config: Arc<Config>,
    hub: Address,
    manager: Address,
    worker: Address,
    state: Mutex<RegistrationState>,
    balance_required: Mutex<AmountRequired>,
    stake_manager: Mutex<Option<Address>>,
    /// Block of the last registration event seen for this manager.
    last_relay_event_block: AtomicU64,
    /// Set on foreign owner or withdrawn stake. Nothing is submitted past
    /// this point.
    terminal: AtomicBool,
}

impl RegistrationManager {
    pub fn new(
        chain: Arc<dyn ChainAccess>,
        tx_manager: Arc<TransactionManager>,
        config: Arc<Config>,
        manager: Address,
        worker: Address,
    ) -> Self {
        let hub = config.relay_hub_address;
        let balance_required = AmountRequired::new(
            "manager balance",
            U256::from(config.manager_min_balance),
        );
        Self {
            chain,
            tx_manager,
            config,
            hub,
            manager,
            worker,
            state: Mutex::new(RegistrationState::default()),
            balance_required: Mutex::new(balance_required),
            stake_manager: Mutex::new(None),
            last_relay_event_block: AtomicU64::new(0),
            terminal: AtomicBool::new(false),
        }
    }

    /// Resolve the stake manager and the current on-chain state. Fails on an
    /// already-foreign owner.
    pub async fn init(&self) -> Result<(), Error> {
        let stake_manager = self.chain.stake_manager_address().await?;
        *self.stake_manager.lock().unwrap() = Some(stake_manager);
        self.refresh_state().await?;

        let owner = self.state.lock().unwrap().owner;
        if let Some(owner) = owner {
            if owner != self.config.owner_address {
                self.terminal.store(true, Ordering::SeqCst);
                return Err(Error::Integrity(format!(
                    "stake owned by foreign address {owner:?}, expected {:?}",
                    self.config.owner_address
                )));
            }
        }
        info!(manager = ?self.manager, stake_manager = ?stake_manager, "registration manager initialized");
        Ok(())
    }

    fn stake_manager_addr(&self) -> Result<Address, Error> {
        self.stake_manager
            .lock()
            .unwrap()
            .ok_or_else(|| Error::Config("registration manager not initialized".into()))
    }

    /// Refresh the manager balance requirement from chain. Returns whether it
    /// is satisfied.
    pub async fn refresh_balance(&self) -> Result<bool, Error> {
        let balance = self.chain.balance(self.manager).await?;
        let mut required = self.balance_required.lock().unwrap();
        required.observe(balance);
        Ok(required.is_satisfied())
    }

    async fn refresh_state(&self) -> Result<(), Error> {
        let info = self.chain.stake_info(self.manager).await?;
        let hub_authorized = self.chain.hub_authorized(self.manager).await?;
        let worker_added = self.chain.worker_added(self.manager, self.worker).await?;

        let mut state = self.state.lock().unwrap();
        state.owner = (!info.owner.is_zero()).then_some(info.owner);
        state.stake = info.stake;
        state.unstake_delay = info.unstake_delay;
        state.withdraw_block = (!info.withdraw_block.is_zero())
            .then(|| info.withdraw_block.as_u64());
        state.staked = info.stake >= U256::from(self.config.registration_stake);
        state.hub_authorized = hub_authorized;
        state.worker_added = worker_added;
        Ok(())
    }

    fn apply_event(&self, event: &HubEvent) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        match &event.kind {
            HubEventKind::StakeAdded => state.staked = true,
            HubEventKind::HubAuthorized => state.hub_authorized = true,
            HubEventKind::HubUnauthorized => state.hub_authorized = false,
            HubEventKind::RelayWorkersAdded => state.worker_added = true,
            HubEventKind::RelayServerRegistered => {
                state.registered = true;
                self.last_relay_event_block
                    .fetch_max(event.block_number, Ordering::SeqCst);
            }
            HubEventKind::OwnerSet { owner } => {
                state.owner = Some(*owner);
                if *owner != self.config.owner_address {
                    drop(state);
                    self.terminal.store(true, Ordering::SeqCst);
                    error!(owner = ?owner, "stake owner changed to a foreign address, refusing to register");
                    return Err(Error::Integrity(format!(
                        "owner set to foreign address {owner:?}"
                    )));
                }
            }
            HubEventKind::StakeUnlocked { withdraw_block } => {
                state.withdraw_block = Some(*withdraw_block);
                state.registered = false;
                drop(state);
                self.terminal.store(true, Ordering::SeqCst);
                error!(withdraw_block, "stake unlocked on-chain, relay is decommissioned");
                return Err(Error::Integrity("stake unlocked".into()));
            }
            HubEventKind::StakeWithdrawn => {
                state.staked = false;
                state.stake = U256::zero();
                state.registered = false;
                drop(state);
                self.terminal.store(true, Ordering::SeqCst);
                error!("stake withdrawn on-chain, relay is decommissioned");
                return Err(Error::Integrity("stake withdrawn".into()));
            }
            // Paymaster rejections concern the alert state, not registration.
            HubEventKind::TransactionRejectedByPaymaster => {}
        }
        Ok(())
    }

    /// True when no registration event has been seen for at least
    /// `registration_block_rate` blocks.
    pub fn should_register_again(&self, current_block: u64) -> bool {
        let rate = self.config.registration_block_rate;
        if rate == 0 {
            return false;
        }
        current_block.saturating_sub(self.last_relay_event_block.load(Ordering::SeqCst)) >= rate
    }

    /// Fold in the events of the scanned window and submit the next missing
    /// registration transition, if any. Returns the submitted tx hashes.
    pub async fn handle_past_events(
        &self,
        events: &[HubEvent],
        current_block: u64,
        gas_price: U256,
        should_register_again: bool,
    ) -> Result<Vec<H256>, Error> {
        self.refresh_state().await?;
        for event in events {
            self.apply_event(event)?;
        }
        if self.terminal.load(Ordering::SeqCst) {
            return Err(Error::Integrity("registration permanently halted".into()));
        }
        if !self.balance_required.lock().unwrap().is_satisfied() {
            debug!("manager balance unsatisfied, deferring registration transitions");
            return Ok(Vec::new());
        }

        let state = self.state.lock().unwrap().clone();
        let transition = self.next_transition(&state, should_register_again)?;
        let Some((action, to, value, data)) = transition else {
            return Ok(Vec::new());
        };

        let gas_limit = self
            .tx_manager
            .attempt_estimate_gas(action_label(action), self.manager, to, data.clone())
            .await?;
        let (tx_hash, _raw) = self
            .tx_manager
            .send_transaction(SendTransactionDetails {
                signer: self.manager,
                action,
                to,
                value,
                gas_limit,
                gas_price,
                data,
                creation_block_number: current_block,
            })
            .await?;
        info!(action = ?action, tx_hash = ?tx_hash, "registration transition submitted");
        Ok(vec![tx_hash])
    }

    /// The next missing transition, unless one is already in flight.
    fn next_transition(
        &self,
        state: &RegistrationState,
        should_register_again: bool,
    ) -> Result<Option<(ServerAction, Address, U256, Bytes)>, Error> {
        let store = self.tx_manager.store();
        let pending = |action: ServerAction| store.is_action_pending(action, Some(self.manager));

        if !state.staked {
            if pending(ServerAction::Stake)? {
                return Ok(None);
            }
            let top_up = U256::from(self.config.registration_stake).saturating_sub(state.stake);
            return Ok(Some((
                ServerAction::Stake,
                self.stake_manager_addr()?,
                top_up,
                calls::stake_for_address(self.manager, self.config.unstake_delay_blocks),
            )));
        }
        if !state.hub_authorized {
            if pending(ServerAction::AuthorizeHub)? {
                return Ok(None);
            }
            return Ok(Some((
                ServerAction::AuthorizeHub,
                self.stake_manager_addr()?,
                U256::zero(),
                calls::authorize_hub_by_owner(self.manager, self.hub),
            )));
        }
        if !state.worker_added {
            if pending(ServerAction::AddWorker)? {
                return Ok(None);
            }
            return Ok(Some((
                ServerAction::AddWorker,
                self.hub,
                U256::zero(),
                calls::add_relay_workers(&[self.worker]),
            )));
        }
        if !state.registered || should_register_again {
            if pending(ServerAction::RegisterServer)? {
                return Ok(None);
            }
            return Ok(Some((
                ServerAction::RegisterServer,
                self.hub,
                U256::zero(),
                calls::register_relay_server(
                    U256::from(self.config.base_relay_fee),
                    U256::from(self.config.pct_relay_fee),
                    &self.config.relay_url,
                ),
            )));
        }
        Ok(None)
    }

    /// Registered, stake intact, no withdrawal scheduled.
    pub fn is_registered(&self) -> bool {
        if self.terminal.load(Ordering::SeqCst) {
            return false;
        }
        let state = self.state.lock().unwrap();
        state.registered && state.withdraw_block.is_none()
    }

    #[cfg(test)]
    pub(crate) fn state_snapshot(&self) -> RegistrationState {
        self.state.lock().unwrap().clone()
    }
}

fn action_label(action: ServerAction) -> &'static str {
    match action {
        ServerAction::Stake => "stakeForAddress",
        ServerAction::AuthorizeHub => "authorizeHubByOwner",
        ServerAction::AddWorker => "addRelayWorkers",
        ServerAction::RegisterServer => "registerRelayServer",
        ServerAction::Unstake => "unstake",
        ServerAction::RelayCall => "relayCall",
        ServerAction::ValueTransfer => "valueTransfer",
        ServerAction::DepositWithdrawal => "withdraw",
        ServerAction::SetOwner => "setOwner",
    }
}
