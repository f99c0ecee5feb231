//! Shared test doubles: a programmable chain and an in-memory journal.

use crate::chain::{
    ChainAccess, HubEvent, PaymasterGasLimits, RelayCallView, RelayFees, StakeInfo,
};
use crate::error::Error;
use crate::schemas::RelayTransactionRequest;
use crate::tx_store::{ServerAction, StoredTransaction, TxStore};
use async_trait::async_trait;
use ethers::abi::Token;
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

struct MockChainState {
    block_number: u64,
    balances: HashMap<Address, U256>,
    gas_price: U256,
    pending_nonces: HashMap<Address, u64>,
    codes: HashMap<Address, Bytes>,
    sent: Vec<Bytes>,
    send_error: Option<String>,
    mined: HashMap<H256, u64>,
    events: Vec<HubEvent>,
    stake_info: StakeInfo,
    hub_authorized: bool,
    worker_added: bool,
    hub_balances: HashMap<Address, U256>,
    paymaster_gas_limits: PaymasterGasLimits,
    estimate_gas: Result<U256, String>,
    relay_call_accepted: bool,
    relay_call_reason: String,
}

pub struct MockChain {
    state: Mutex<MockChainState>,
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockChainState {
                block_number: 100,
                balances: HashMap::new(),
                gas_price: U256::from(10u64),
                pending_nonces: HashMap::new(),
                codes: HashMap::new(),
                sent: Vec::new(),
                send_error: None,
                mined: HashMap::new(),
                events: Vec::new(),
                stake_info: StakeInfo::default(),
                hub_authorized: false,
                worker_added: false,
                hub_balances: HashMap::new(),
                paymaster_gas_limits: PaymasterGasLimits {
                    acceptance_budget: U256::from(100_000u64),
                    pre_relayed_call_gas_limit: U256::from(50_000u64),
                    post_relayed_call_gas_limit: U256::from(50_000u64),
                },
                estimate_gas: Ok(U256::from(100_000u64)),
                relay_call_accepted: true,
                relay_call_reason: String::new(),
            }),
        }
    }

    pub fn set_block_number(&self, block: u64) {
        self.state.lock().unwrap().block_number = block;
    }

    pub fn set_balance(&self, addr: Address, balance: U256) {
        self.state.lock().unwrap().balances.insert(addr, balance);
    }

    pub fn set_gas_price(&self, price: U256) {
        self.state.lock().unwrap().gas_price = price;
    }

    pub fn set_pending_nonce(&self, addr: Address, nonce: u64) {
        self.state.lock().unwrap().pending_nonces.insert(addr, nonce);
    }

    pub fn set_code(&self, addr: Address, code: Bytes) {
        self.state.lock().unwrap().codes.insert(addr, code);
    }

    pub fn set_send_error(&self, error: Option<&str>) {
        self.state.lock().unwrap().send_error = error.map(String::from);
    }

    pub fn set_mined(&self, tx_hash: H256, block: u64) {
        self.state.lock().unwrap().mined.insert(tx_hash, block);
    }

    pub fn push_event(&self, event: HubEvent) {
        self.state.lock().unwrap().events.push(event);
    }

    pub fn set_stake_info(&self, info: StakeInfo) {
        self.state.lock().unwrap().stake_info = info;
    }

    pub fn set_hub_authorized(&self, authorized: bool) {
        self.state.lock().unwrap().hub_authorized = authorized;
    }

    pub fn set_worker_added(&self, added: bool) {
        self.state.lock().unwrap().worker_added = added;
    }

    pub fn set_hub_balance(&self, addr: Address, balance: U256) {
        self.state.lock().unwrap().hub_balances.insert(addr, balance);
    }

    pub fn set_paymaster_gas_limits(&self, limits: PaymasterGasLimits) {
        self.state.lock().unwrap().paymaster_gas_limits = limits;
    }

    pub fn set_estimate_gas(&self, result: Result<U256, String>) {
        self.state.lock().unwrap().estimate_gas = result;
    }

    pub fn set_relay_call_result(&self, accepted: bool, reason: &str) {
        let mut state = self.state.lock().unwrap();
        state.relay_call_accepted = accepted;
        state.relay_call_reason = reason.to_string();
    }

    pub fn sent_count(&self) -> usize {
        self.state.lock().unwrap().sent.len()
    }
}

#[async_trait]
impl ChainAccess for MockChain {
    async fn block_number(&self) -> Result<u64, Error> {
        Ok(self.state.lock().unwrap().block_number)
    }

    async fn balance(&self, addr: Address) -> Result<U256, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .balances
            .get(&addr)
            .copied()
            .unwrap_or_default())
    }

    async fn gas_price(&self) -> Result<U256, Error> {
        Ok(self.state.lock().unwrap().gas_price)
    }

    async fn chain_id(&self) -> Result<u64, Error> {
        Ok(1337)
    }

    async fn network_id(&self) -> Result<u64, Error> {
        Ok(1337)
    }

    async fn code_at(&self, addr: Address) -> Result<Bytes, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .codes
            .get(&addr)
            .cloned()
            .unwrap_or_else(|| Bytes::from(vec![0x60, 0x80])))
    }

    async fn pending_nonce(&self, addr: Address) -> Result<u64, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .pending_nonces
            .get(&addr)
            .copied()
            .unwrap_or(0))
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, Error> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = &state.send_error {
            return Err(Error::Chain(error.clone()));
        }
        let hash = H256::from(keccak256(&raw));
        state.sent.push(raw);
        Ok(hash)
    }

    async fn estimate_gas(
        &self,
        _from: Address,
        _to: Address,
        _data: Bytes,
    ) -> Result<U256, Error> {
        self.state
            .lock()
            .unwrap()
            .estimate_gas
            .clone()
            .map_err(Error::Chain)
    }

    async fn transaction_mined_block(&self, tx_hash: H256) -> Result<Option<u64>, Error> {
        Ok(self.state.lock().unwrap().mined.get(&tx_hash).copied())
    }

    async fn hub_events(
        &self,
        _manager: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<HubEvent>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| e.block_number >= from_block && e.block_number <= to_block)
            .cloned()
            .collect())
    }

    async fn stake_manager_address(&self) -> Result<Address, Error> {
        Ok(Address::repeat_byte(0x5a))
    }

    async fn stake_info(&self, _manager: Address) -> Result<StakeInfo, Error> {
        Ok(self.state.lock().unwrap().stake_info.clone())
    }

    async fn hub_authorized(&self, _manager: Address) -> Result<bool, Error> {
        Ok(self.state.lock().unwrap().hub_authorized)
    }

    async fn worker_added(&self, _manager: Address, _worker: Address) -> Result<bool, Error> {
        Ok(self.state.lock().unwrap().worker_added)
    }

    async fn hub_balance_of(&self, account: Address) -> Result<U256, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .hub_balances
            .get(&account)
            .copied()
            .unwrap_or_default())
    }

    async fn paymaster_gas_limits(
        &self,
        _paymaster: Address,
    ) -> Result<PaymasterGasLimits, Error> {
        Ok(self.state.lock().unwrap().paymaster_gas_limits)
    }

    async fn hub_max_charge(
        &self,
        max_gas: U256,
        gas_price: U256,
        fees: &RelayFees,
    ) -> Result<U256, Error> {
        // Same formula a real hub applies: gas cost plus percentage plus base.
        let gas_cost = max_gas * gas_price;
        Ok(gas_cost * (U256::from(100u64) + fees.pct_relay_fee) / U256::from(100u64)
            + fees.base_relay_fee)
    }

    async fn simulate_relay_call(
        &self,
        _from: Address,
        _request: &RelayTransactionRequest,
        _acceptance_budget: U256,
        _max_possible_gas: U256,
    ) -> Result<RelayCallView, Error> {
        let state = self.state.lock().unwrap();
        let return_value = if state.relay_call_accepted {
            Bytes::new()
        } else {
            ethers::abi::encode(&[Token::String(state.relay_call_reason.clone())]).into()
        };
        Ok(RelayCallView {
            paymaster_accepted: state.relay_call_accepted,
            return_value,
        })
    }
}

// ── In-memory journal ────────────────────────────────────────────────────

pub struct MemTxStore {
    records: Mutex<BTreeMap<(Address, u64), StoredTransaction>>,
}

impl MemTxStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
        }
    }
}

impl TxStore for MemTxStore {
    fn put(&self, tx: &StoredTransaction) -> Result<(), Error> {
        self.records
            .lock()
            .unwrap()
            .insert((tx.from, tx.nonce), tx.clone());
        Ok(())
    }

    fn all_by_signer(&self, from: Address) -> Result<Vec<StoredTransaction>, Error> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|tx| tx.from == from)
            .cloned()
            .collect())
    }

    fn oldest_pending(&self, from: Address) -> Result<Option<StoredTransaction>, Error> {
        Ok(self
            .all_by_signer(from)?
            .into_iter()
            .find(|tx| !tx.is_mined()))
    }

    fn is_action_pending(
        &self,
        action: ServerAction,
        signer: Option<Address>,
    ) -> Result<bool, Error> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .any(|tx| {
                !tx.is_mined()
                    && tx.server_action == action
                    && signer.map(|s| tx.from == s).unwrap_or(true)
            }))
    }

    fn remove_txs_until_nonce(&self, from: Address, nonce: u64) -> Result<usize, Error> {
        let mut records = self.records.lock().unwrap();
        let doomed: Vec<(Address, u64)> = records
            .values()
            .filter(|tx| tx.from == from && tx.nonce <= nonce && tx.is_mined())
            .map(|tx| (tx.from, tx.nonce))
            .collect();
        let removed = doomed.len();
        for key in doomed {
            records.remove(&key);
        }
        Ok(removed)
    }

    fn signers(&self) -> Result<Vec<Address>, Error> {
        let mut out: Vec<Address> = Vec::new();
        for (addr, _) in self.records.lock().unwrap().keys() {
            if out.last() != Some(addr) {
                out.push(*addr);
            }
        }
        Ok(out)
    }
}

/// A fully wired server over the mock chain and the in-memory journal, with
/// a deployed hub and a matching stake owner.
pub async fn test_server(
    mutate: impl FnOnce(&mut crate::config::Config),
) -> (
    std::sync::Arc<crate::server::RelayServer>,
    std::sync::Arc<MockChain>,
    std::sync::Arc<MemTxStore>,
) {
    use crate::keys::LocalKeyStore;
    use std::sync::Arc;

    let mut config = crate::config::Config::default();
    config.relay_hub_address = Address::repeat_byte(0xfe);
    config.owner_address = Address::repeat_byte(0x07);
    mutate(&mut config);

    let chain = Arc::new(MockChain::new());
    let keys = Arc::new(LocalKeyStore::ephemeral(2, 1337));
    let store = Arc::new(MemTxStore::new());
    let server = crate::server::RelayServer::init(
        config,
        chain.clone() as Arc<dyn ChainAccess>,
        keys,
        store.clone() as Arc<dyn TxStore>,
    )
    .await
    .unwrap();
    (server, chain, store)
}

/// A well-formed relay request against the given server identity. Tests
/// mutate the parts they need.
pub fn sample_relay_request(
    hub: Address,
    worker: Address,
    paymaster: Address,
    gas_price: U256,
) -> RelayTransactionRequest {
    use crate::schemas::*;
    RelayTransactionRequest {
        relay_request: RelayRequest {
            request: ForwardRequest {
                from: Address::repeat_byte(0x0a),
                to: Address::repeat_byte(0x0b),
                value: U256::zero(),
                gas: U256::from(200_000u64),
                nonce: U256::zero(),
                data: Bytes::from(vec![0xde, 0xad]),
            },
            relay_data: RelayData {
                gas_price,
                pct_relay_fee: U256::from(10u64),
                base_relay_fee: U256::zero(),
                relay_worker: worker,
                paymaster,
                paymaster_data: Bytes::new(),
                client_id: U256::one(),
            },
        },
        metadata: RelayMetadata {
            relay_hub_address: hub,
            relay_max_nonce: 1_000,
            signature: Bytes::from(vec![0xab; 65]),
            approval_data: Bytes::new(),
        },
    }
}
