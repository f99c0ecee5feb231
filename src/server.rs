//! Relay server facade.
//!
//! Composes the ports and managers, owns the readiness and alert state, and
//! exposes the event stream the HTTP layer and operators subscribe to. The
//! reconciliation tick lives in [`crate::reconcile`], request admission in
//! [`crate::admission`].

use crate::chain::{ChainAccess, PaymasterGasLimits};
use crate::config::Config;
use crate::error::Error;
use crate::keys::{KeyStore, MANAGER_INDEX, WORKER_INDEX};
use crate::registration::RegistrationManager;
use crate::tx_manager::{mul_factor, TransactionManager};
use crate::tx_store::TxStore;
use ethers::types::{Address, U256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Out-of-band notifications emitted by the server.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// The manager cannot cover a needed worker refill.
    FundingNeeded(String),
    /// A reconciliation tick failed; the round counter was reset.
    TickError(String),
    /// A paymaster rejection was observed; admissions are throttled.
    Alerted { block: u64 },
    ReadinessChanged(bool),
}

pub struct RelayServer {
    pub config: Arc<Config>,
    pub(crate) chain: Arc<dyn ChainAccess>,
    pub(crate) store: Arc<dyn TxStore>,
    pub tx_manager: Arc<TransactionManager>,
    pub registration: RegistrationManager,

    pub(crate) manager: Address,
    pub(crate) worker: Address,
    pub(crate) hub: Address,
    pub(crate) chain_id: u64,
    pub(crate) network_id: u64,

    gas_price: Mutex<U256>,
    ready: AtomicBool,
    successful_rounds: AtomicU32,
    pub(crate) alerted_block: Mutex<Option<u64>>,

    pub(crate) tick_in_progress: AtomicBool,
    pub(crate) last_scanned_block: AtomicU64,
    pub(crate) last_refresh_block: AtomicU64,
    pub(crate) last_tick_at: Mutex<Instant>,

    /// Gas limits of trusted paymasters, assumed constant once fetched.
    pub(crate) trusted_limits: Mutex<HashMap<Address, PaymasterGasLimits>>,

    events: broadcast::Sender<ServerEvent>,
    pub start_time: Instant,
    pub request_count: AtomicU64,
}

impl std::fmt::Debug for RelayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayServer")
            .field("manager", &self.manager)
            .field("worker", &self.worker)
            .field("hub", &self.hub)
            .field("chain_id", &self.chain_id)
            .field("network_id", &self.network_id)
            .finish_non_exhaustive()
    }
}

impl RelayServer {
    /// Wire the ports together and verify this server's on-chain identity.
    /// Fails fast when the hub is not deployed or the stake has a foreign
    /// owner.
    pub async fn init(
        config: Config,
        chain: Arc<dyn ChainAccess>,
        keys: Arc<dyn KeyStore>,
        store: Arc<dyn TxStore>,
    ) -> Result<Arc<Self>, Error> {
        let config = Arc::new(config);
        let hub = config.relay_hub_address;

        let code = chain.code_at(hub).await?;
        if code.is_empty() {
            return Err(Error::Integrity(format!(
                "relay hub not deployed at {hub:?}"
            )));
        }

        let chain_id = chain.chain_id().await?;
        let network_id = chain.network_id().await?;

        let manager = keys
            .address(MANAGER_INDEX)
            .ok_or_else(|| Error::Config("keystore is missing the manager key".into()))?;
        let worker = keys
            .address(WORKER_INDEX)
            .ok_or_else(|| Error::Config("keystore is missing the worker key".into()))?;

        let tx_manager = Arc::new(TransactionManager::new(
            Arc::clone(&chain),
            keys,
            Arc::clone(&store),
            Arc::clone(&config),
            chain_id,
        ));
        let registration = RegistrationManager::new(
            Arc::clone(&chain),
            Arc::clone(&tx_manager),
            Arc::clone(&config),
            manager,
            worker,
        );
        registration.init().await?;

        let initial_gas_price = mul_factor(chain.gas_price().await?, config.gas_price_factor);

        let (events, _) = broadcast::channel(64);
        let server = Arc::new(Self {
            chain,
            store,
            tx_manager,
            registration,
            manager,
            worker,
            hub,
            chain_id,
            network_id,
            gas_price: Mutex::new(initial_gas_price),
            ready: AtomicBool::new(false),
            successful_rounds: AtomicU32::new(0),
            alerted_block: Mutex::new(None),
            tick_in_progress: AtomicBool::new(false),
            last_scanned_block: AtomicU64::new(0),
            last_refresh_block: AtomicU64::new(0),
            last_tick_at: Mutex::new(Instant::now()),
            trusted_limits: Mutex::new(HashMap::new()),
            events,
            start_time: Instant::now(),
            request_count: AtomicU64::new(0),
            config,
        });

        server.prefetch_trusted_limits().await;

        info!(
            manager = ?server.manager,
            worker = ?server.worker,
            hub = ?server.hub,
            chain_id = server.chain_id,
            "relay server initialized"
        );
        Ok(server)
    }

    /// Cache the gas limits of configured trusted paymasters. Best-effort;
    /// failures fall back to an on-demand fetch during admission.
    async fn prefetch_trusted_limits(&self) {
        for paymaster in &self.config.trusted_paymasters {
            match self.chain.paymaster_gas_limits(*paymaster).await {
                Ok(limits) => {
                    self.trusted_limits.lock().unwrap().insert(*paymaster, limits);
                }
                Err(e) => {
                    warn!(paymaster = ?paymaster, error = %e, "failed to prefetch trusted paymaster limits");
                }
            }
        }
    }

    pub fn manager_address(&self) -> Address {
        self.manager
    }

    pub fn worker_address(&self) -> Address {
        self.worker
    }

    pub fn hub_address(&self) -> Address {
        self.hub
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn network_id(&self) -> u64 {
        self.network_id
    }

    /// The gas price floor applied to incoming requests, refreshed each tick.
    pub fn gas_price(&self) -> U256 {
        *self.gas_price.lock().unwrap()
    }

    pub(crate) fn set_gas_price(&self, price: U256) {
        *self.gas_price.lock().unwrap() = price;
    }

    pub fn is_trusted_paymaster(&self, paymaster: Address) -> bool {
        self.config.trusted_paymasters.contains(&paymaster)
    }

    // ── Readiness ────────────────────────────────────────────────────────

    /// Externally visible readiness. True only after
    /// `successful_rounds_for_ready` consecutive successful rounds, which
    /// debounces transient RPC outages.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
            && self.successful_rounds.load(Ordering::SeqCst)
                >= self.config.successful_rounds_for_ready
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        let was_ready = self.is_ready();
        if ready {
            // The round that first turns ready does not count towards the
            // hysteresis; only the clean rounds after it do.
            if self.ready.swap(true, Ordering::SeqCst) {
                self.successful_rounds.fetch_add(1, Ordering::SeqCst);
            } else {
                self.successful_rounds.store(0, Ordering::SeqCst);
            }
        } else {
            self.ready.store(false, Ordering::SeqCst);
            self.successful_rounds.store(0, Ordering::SeqCst);
        }
        let now_ready = self.is_ready();
        if now_ready != was_ready {
            info!(ready = now_ready, "readiness changed");
            self.emit(ServerEvent::ReadinessChanged(now_ready));
        }
    }

    /// Zero the success-round counter without touching the in-flight tick.
    pub(crate) fn reset_rounds(&self) {
        let was_ready = self.is_ready();
        self.successful_rounds.store(0, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
        if was_ready {
            info!(ready = false, "readiness changed");
            self.emit(ServerEvent::ReadinessChanged(false));
        }
    }

    // ── Alert state ──────────────────────────────────────────────────────

    pub fn is_alerted(&self) -> bool {
        self.alerted_block.lock().unwrap().is_some()
    }

    pub(crate) fn enter_alerted(&self, block: u64) {
        *self.alerted_block.lock().unwrap() = Some(block);
        warn!(block, "paymaster rejection observed, entering alerted state");
        self.emit(ServerEvent::Alerted { block });
    }

    // ── Events ───────────────────────────────────────────────────────────

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: ServerEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}
