//! Chain access port.
//!
//! Everything the relay needs from the blockchain sits behind the
//! [`ChainAccess`] trait: block/balance/gas queries, raw broadcast, hub and
//! stake-manager views, and event log fetching. [`EthersChain`] implements it
//! over a JSON-RPC provider; tests swap in a programmable mock.

use crate::error::Error;
use crate::schemas::RelayTransactionRequest;
use async_trait::async_trait;
use ethers::abi::{decode, ParamType, Token};
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, BlockNumber, Bytes, Filter, Log, TransactionRequest, ValueOrArray, H256, U256,
};
use ethers::utils::{id, keccak256};
use std::sync::Mutex;
use tracing::debug;

/// Max block span per `eth_getLogs` request.
const LOG_PAGE_BLOCKS: u64 = 5_000;

/// Stake state of a relay manager, as reported by the stake manager contract.
#[derive(Debug, Clone, Default)]
pub struct StakeInfo {
    pub stake: U256,
    pub unstake_delay: U256,
    pub withdraw_block: U256,
    pub owner: Address,
}

/// Paymaster gas limits, as reported by `getGasLimits()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PaymasterGasLimits {
    pub acceptance_budget: U256,
    pub pre_relayed_call_gas_limit: U256,
    pub post_relayed_call_gas_limit: U256,
}

/// Fee terms used by the hub to compute the maximum charge.
#[derive(Debug, Clone, Copy)]
pub struct RelayFees {
    pub pct_relay_fee: U256,
    pub base_relay_fee: U256,
}

/// Outcome of a simulated `relayCall`.
#[derive(Debug, Clone)]
pub struct RelayCallView {
    pub paymaster_accepted: bool,
    pub return_value: Bytes,
}

impl RelayCallView {
    /// Best-effort human-readable rejection reason.
    pub fn reason(&self) -> String {
        if self.return_value.is_empty() {
            return "no reason given".into();
        }
        match decode(&[ParamType::String], &self.return_value) {
            Ok(tokens) => match tokens.first() {
                Some(Token::String(s)) => s.clone(),
                _ => hex::encode(&self.return_value),
            },
            Err(_) => String::from_utf8_lossy(&self.return_value).into_owned(),
        }
    }
}

/// A decoded hub or stake-manager event relevant to this relay manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubEvent {
    pub block_number: u64,
    pub kind: HubEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEventKind {
    HubAuthorized,
    HubUnauthorized,
    RelayWorkersAdded,
    StakeAdded,
    StakeUnlocked { withdraw_block: u64 },
    StakeWithdrawn,
    OwnerSet { owner: Address },
    RelayServerRegistered,
    TransactionRejectedByPaymaster,
}

#[async_trait]
pub trait ChainAccess: Send + Sync {
    async fn block_number(&self) -> Result<u64, Error>;
    async fn balance(&self, addr: Address) -> Result<U256, Error>;
    async fn gas_price(&self) -> Result<U256, Error>;
    async fn chain_id(&self) -> Result<u64, Error>;
    async fn network_id(&self) -> Result<u64, Error>;
    async fn code_at(&self, addr: Address) -> Result<Bytes, Error>;
    /// Chain-reported next nonce, including mempool-pending transactions.
    async fn pending_nonce(&self, addr: Address) -> Result<u64, Error>;
    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, Error>;
    async fn estimate_gas(&self, from: Address, to: Address, data: Bytes) -> Result<U256, Error>;
    /// Block the transaction was mined in, if any.
    async fn transaction_mined_block(&self, tx_hash: H256) -> Result<Option<u64>, Error>;
    /// Hub and stake-manager events for `manager` in `[from_block, to_block]`,
    /// in on-chain order.
    async fn hub_events(
        &self,
        manager: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<HubEvent>, Error>;
    async fn stake_manager_address(&self) -> Result<Address, Error>;
    async fn stake_info(&self, manager: Address) -> Result<StakeInfo, Error>;
    async fn hub_authorized(&self, manager: Address) -> Result<bool, Error>;
    async fn worker_added(&self, manager: Address, worker: Address) -> Result<bool, Error>;
    /// Hub-held deposit of `account` (manager withdrawals, paymaster funding).
    async fn hub_balance_of(&self, account: Address) -> Result<U256, Error>;
    async fn paymaster_gas_limits(&self, paymaster: Address)
        -> Result<PaymasterGasLimits, Error>;
    /// What the hub would charge the paymaster for a relayed call that burns
    /// `max_gas` at `gas_price` under the request's fee terms.
    async fn hub_max_charge(
        &self,
        max_gas: U256,
        gas_price: U256,
        fees: &RelayFees,
    ) -> Result<U256, Error>;
    /// Simulate `relayCall` from the worker without spending gas.
    async fn simulate_relay_call(
        &self,
        from: Address,
        request: &RelayTransactionRequest,
        acceptance_budget: U256,
        max_possible_gas: U256,
    ) -> Result<RelayCallView, Error>;
}

// ── Contract call encoding ───────────────────────────────────────────────

/// Method-call payload builders for the hub and stake manager. Pure; unit
/// tested against known selectors.
pub mod calls {
    use super::*;

    fn call_data(selector: [u8; 4], tokens: &[Token]) -> Bytes {
        let mut out = selector.to_vec();
        out.extend(ethers::abi::encode(tokens));
        out.into()
    }

    pub fn stake_for_address(manager: Address, unstake_delay: u64) -> Bytes {
        call_data(
            id("stakeForAddress(address,uint256)"),
            &[Token::Address(manager), Token::Uint(unstake_delay.into())],
        )
    }

    pub fn authorize_hub_by_owner(manager: Address, hub: Address) -> Bytes {
        call_data(
            id("authorizeHubByOwner(address,address)"),
            &[Token::Address(manager), Token::Address(hub)],
        )
    }

    pub fn add_relay_workers(workers: &[Address]) -> Bytes {
        call_data(
            id("addRelayWorkers(address[])"),
            &[Token::Array(
                workers.iter().copied().map(Token::Address).collect(),
            )],
        )
    }

    pub fn register_relay_server(base_relay_fee: U256, pct_relay_fee: U256, url: &str) -> Bytes {
        call_data(
            id("registerRelayServer(uint256,uint256,string)"),
            &[
                Token::Uint(base_relay_fee),
                Token::Uint(pct_relay_fee),
                Token::String(url.to_string()),
            ],
        )
    }

    pub fn withdraw(amount: U256, dest: Address) -> Bytes {
        call_data(
            id("withdraw(uint256,address)"),
            &[Token::Uint(amount), Token::Address(dest)],
        )
    }

    pub fn stake_manager() -> Bytes {
        call_data(id("stakeManager()"), &[])
    }

    pub fn get_stake_info(manager: Address) -> Bytes {
        call_data(id("getStakeInfo(address)"), &[Token::Address(manager)])
    }

    pub fn is_hub_authorized(manager: Address, hub: Address) -> Bytes {
        call_data(
            id("isHubAuthorized(address,address)"),
            &[Token::Address(manager), Token::Address(hub)],
        )
    }

    pub fn worker_to_manager(worker: Address) -> Bytes {
        call_data(id("workerToManager(address)"), &[Token::Address(worker)])
    }

    pub fn balance_of(account: Address) -> Bytes {
        call_data(id("balanceOf(address)"), &[Token::Address(account)])
    }

    pub fn get_gas_limits() -> Bytes {
        call_data(id("getGasLimits()"), &[])
    }

    pub fn calculate_charge(max_gas: U256, gas_price: U256, fees: &RelayFees) -> Bytes {
        call_data(
            id("calculateCharge(uint256,uint256,uint256,uint256)"),
            &[
                Token::Uint(max_gas),
                Token::Uint(gas_price),
                Token::Uint(fees.pct_relay_fee),
                Token::Uint(fees.base_relay_fee),
            ],
        )
    }

    /// ABI tuple for the relay request as the hub expects it:
    /// `((from,to,value,gas,nonce,data),(gasPrice,pctRelayFee,baseRelayFee,relayWorker,paymaster,paymasterData,clientId))`.
    fn relay_request_token(request: &RelayTransactionRequest) -> Token {
        let fwd = &request.relay_request.request;
        let rd = &request.relay_request.relay_data;
        Token::Tuple(vec![
            Token::Tuple(vec![
                Token::Address(fwd.from),
                Token::Address(fwd.to),
                Token::Uint(fwd.value),
                Token::Uint(fwd.gas),
                Token::Uint(fwd.nonce),
                Token::Bytes(fwd.data.to_vec()),
            ]),
            Token::Tuple(vec![
                Token::Uint(rd.gas_price),
                Token::Uint(rd.pct_relay_fee),
                Token::Uint(rd.base_relay_fee),
                Token::Address(rd.relay_worker),
                Token::Address(rd.paymaster),
                Token::Bytes(rd.paymaster_data.to_vec()),
                Token::Uint(rd.client_id),
            ]),
        ])
    }

    pub fn relay_call(
        acceptance_budget: U256,
        request: &RelayTransactionRequest,
        max_possible_gas: U256,
    ) -> Bytes {
        call_data(
            id("relayCall(uint256,((address,address,uint256,uint256,uint256,bytes),(uint256,uint256,uint256,address,address,bytes,uint256)),bytes,bytes,uint256)"),
            &[
                Token::Uint(acceptance_budget),
                relay_request_token(request),
                Token::Bytes(request.metadata.signature.to_vec()),
                Token::Bytes(request.metadata.approval_data.to_vec()),
                Token::Uint(max_possible_gas),
            ],
        )
    }
}

// ── Event decoding ───────────────────────────────────────────────────────

fn address_topic(addr: Address) -> H256 {
    let mut padded = [0u8; 32];
    padded[12..].copy_from_slice(addr.as_bytes());
    H256::from(padded)
}

fn topic_of(signature: &str) -> H256 {
    H256::from(keccak256(signature.as_bytes()))
}

fn decode_hub_log(log: &Log) -> Option<HubEvent> {
    let topic0 = *log.topics.first()?;
    let block_number = log.block_number?.as_u64();

    let kind = if topic0 == topic_of("StakeAdded(address,address,uint256,uint256)") {
        HubEventKind::StakeAdded
    } else if topic0 == topic_of("StakeUnlocked(address,address,uint256)") {
        let withdraw_block = decode(&[ParamType::Uint(256)], &log.data)
            .ok()
            .and_then(|t| t.first().cloned())
            .and_then(|t| t.into_uint())
            .map(|u| u.as_u64())?;
        HubEventKind::StakeUnlocked { withdraw_block }
    } else if topic0 == topic_of("StakeWithdrawn(address,address,uint256)") {
        HubEventKind::StakeWithdrawn
    } else if topic0 == topic_of("OwnerSet(address,address)") {
        let owner = Address::from_slice(&log.topics.get(2)?.as_bytes()[12..]);
        HubEventKind::OwnerSet { owner }
    } else if topic0 == topic_of("HubAuthorized(address,address)") {
        HubEventKind::HubAuthorized
    } else if topic0 == topic_of("HubUnauthorized(address,address)") {
        HubEventKind::HubUnauthorized
    } else if topic0 == topic_of("RelayWorkersAdded(address,address[],uint256)") {
        HubEventKind::RelayWorkersAdded
    } else if topic0 == topic_of("RelayServerRegistered(address,uint256,uint256,string)") {
        HubEventKind::RelayServerRegistered
    } else if topic0 == topic_of("TransactionRejectedByPaymaster(address,address,bytes)") {
        HubEventKind::TransactionRejectedByPaymaster
    } else {
        return None;
    };

    Some(HubEvent { block_number, kind })
}

// ── Provider-backed implementation ───────────────────────────────────────

/// [`ChainAccess`] over a JSON-RPC HTTP provider.
pub struct EthersChain {
    provider: Provider<Http>,
    hub: Address,
    stake_manager: Mutex<Option<Address>>,
}

impl EthersChain {
    pub fn new(rpc_url: &str, hub: Address) -> Result<Self, Error> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| Error::Config(format!("invalid rpc url {rpc_url}: {e}")))?;
        Ok(Self {
            provider,
            hub,
            stake_manager: Mutex::new(None),
        })
    }

    async fn eth_call(&self, to: Address, data: Bytes) -> Result<Bytes, Error> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        self.provider
            .call(&tx, None)
            .await
            .map_err(|e| Error::Chain(format!("eth_call to {to:?} failed: {e}")))
    }

    async fn eth_call_from(&self, from: Address, to: Address, data: Bytes) -> Result<Bytes, Error> {
        let tx: TypedTransaction = TransactionRequest::new().from(from).to(to).data(data).into();
        self.provider
            .call(&tx, None)
            .await
            .map_err(|e| Error::Chain(format!("eth_call to {to:?} failed: {e}")))
    }
}

#[async_trait]
impl ChainAccess for EthersChain {
    async fn block_number(&self) -> Result<u64, Error> {
        Ok(self
            .provider
            .get_block_number()
            .await
            .map_err(|e| Error::Chain(format!("blockNumber: {e}")))?
            .as_u64())
    }

    async fn balance(&self, addr: Address) -> Result<U256, Error> {
        self.provider
            .get_balance(addr, None)
            .await
            .map_err(|e| Error::Chain(format!("getBalance: {e}")))
    }

    async fn gas_price(&self) -> Result<U256, Error> {
        self.provider
            .get_gas_price()
            .await
            .map_err(|e| Error::Chain(format!("gasPrice: {e}")))
    }

    async fn chain_id(&self) -> Result<u64, Error> {
        Ok(self
            .provider
            .get_chainid()
            .await
            .map_err(|e| Error::Chain(format!("chainId: {e}")))?
            .as_u64())
    }

    async fn network_id(&self) -> Result<u64, Error> {
        self.provider
            .get_net_version()
            .await
            .map_err(|e| Error::Chain(format!("netVersion: {e}")))?
            .parse::<u64>()
            .map_err(|e| Error::Chain(format!("netVersion parse: {e}")))
    }

    async fn code_at(&self, addr: Address) -> Result<Bytes, Error> {
        self.provider
            .get_code(addr, None)
            .await
            .map_err(|e| Error::Chain(format!("getCode: {e}")))
    }

    async fn pending_nonce(&self, addr: Address) -> Result<u64, Error> {
        Ok(self
            .provider
            .get_transaction_count(addr, Some(BlockNumber::Pending.into()))
            .await
            .map_err(|e| Error::Chain(format!("getTransactionCount: {e}")))?
            .as_u64())
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, Error> {
        let pending = self
            .provider
            .send_raw_transaction(raw)
            .await
            .map_err(|e| Error::Chain(format!("sendRawTransaction: {e}")))?;
        Ok(pending.tx_hash())
    }

    async fn estimate_gas(&self, from: Address, to: Address, data: Bytes) -> Result<U256, Error> {
        let tx: TypedTransaction = TransactionRequest::new().from(from).to(to).data(data).into();
        self.provider
            .estimate_gas(&tx, None)
            .await
            .map_err(|e| Error::Chain(format!("estimateGas: {e}")))
    }

    async fn transaction_mined_block(&self, tx_hash: H256) -> Result<Option<u64>, Error> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| Error::Chain(format!("getTransactionReceipt: {e}")))?;
        Ok(receipt.and_then(|r| r.block_number).map(|b| b.as_u64()))
    }

    async fn hub_events(
        &self,
        manager: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<HubEvent>, Error> {
        let stake_manager = self.stake_manager_address().await?;
        let mut events = Vec::new();
        let mut cursor = from_block;

        // Paginate so a fresh scan from block 0 stays within provider limits.
        while cursor <= to_block {
            let page_end = to_block.min(cursor + LOG_PAGE_BLOCKS - 1);
            let filter = Filter::new()
                .address(ValueOrArray::Array(vec![self.hub, stake_manager]))
                .topic1(address_topic(manager))
                .from_block(cursor)
                .to_block(page_end);
            let logs = self
                .provider
                .get_logs(&filter)
                .await
                .map_err(|e| Error::Chain(format!("getLogs [{cursor},{page_end}]: {e}")))?;
            debug!(from = cursor, to = page_end, logs = logs.len(), "scanned hub logs");
            events.extend(logs.iter().filter_map(decode_hub_log));
            cursor = page_end + 1;
        }
        Ok(events)
    }

    async fn stake_manager_address(&self) -> Result<Address, Error> {
        if let Some(addr) = *self.stake_manager.lock().unwrap() {
            return Ok(addr);
        }
        let out = self.eth_call(self.hub, calls::stake_manager()).await?;
        let tokens = decode(&[ParamType::Address], &out)
            .map_err(|e| Error::Chain(format!("stakeManager decode: {e}")))?;
        let addr = tokens
            .into_iter()
            .next()
            .and_then(|t| t.into_address())
            .ok_or_else(|| Error::Chain("stakeManager returned no address".into()))?;
        *self.stake_manager.lock().unwrap() = Some(addr);
        Ok(addr)
    }

    async fn stake_info(&self, manager: Address) -> Result<StakeInfo, Error> {
        let stake_manager = self.stake_manager_address().await?;
        let out = self
            .eth_call(stake_manager, calls::get_stake_info(manager))
            .await?;
        let tokens = decode(
            &[
                ParamType::Uint(256),
                ParamType::Uint(256),
                ParamType::Uint(256),
                ParamType::Address,
            ],
            &out,
        )
        .map_err(|e| Error::Chain(format!("getStakeInfo decode: {e}")))?;
        let mut it = tokens.into_iter();
        Ok(StakeInfo {
            stake: it.next().and_then(|t| t.into_uint()).unwrap_or_default(),
            unstake_delay: it.next().and_then(|t| t.into_uint()).unwrap_or_default(),
            withdraw_block: it.next().and_then(|t| t.into_uint()).unwrap_or_default(),
            owner: it.next().and_then(|t| t.into_address()).unwrap_or_default(),
        })
    }

    async fn hub_authorized(&self, manager: Address) -> Result<bool, Error> {
        let stake_manager = self.stake_manager_address().await?;
        let out = self
            .eth_call(stake_manager, calls::is_hub_authorized(manager, self.hub))
            .await?;
        let tokens = decode(&[ParamType::Bool], &out)
            .map_err(|e| Error::Chain(format!("isHubAuthorized decode: {e}")))?;
        Ok(tokens
            .into_iter()
            .next()
            .and_then(|t| t.into_bool())
            .unwrap_or(false))
    }

    async fn worker_added(&self, manager: Address, worker: Address) -> Result<bool, Error> {
        let out = self.eth_call(self.hub, calls::worker_to_manager(worker)).await?;
        let tokens = decode(&[ParamType::Address], &out)
            .map_err(|e| Error::Chain(format!("workerToManager decode: {e}")))?;
        Ok(tokens
            .into_iter()
            .next()
            .and_then(|t| t.into_address())
            .map(|a| a == manager)
            .unwrap_or(false))
    }

    async fn hub_balance_of(&self, account: Address) -> Result<U256, Error> {
        let out = self.eth_call(self.hub, calls::balance_of(account)).await?;
        let tokens = decode(&[ParamType::Uint(256)], &out)
            .map_err(|e| Error::Chain(format!("balanceOf decode: {e}")))?;
        Ok(tokens
            .into_iter()
            .next()
            .and_then(|t| t.into_uint())
            .unwrap_or_default())
    }

    async fn paymaster_gas_limits(
        &self,
        paymaster: Address,
    ) -> Result<PaymasterGasLimits, Error> {
        let out = self.eth_call(paymaster, calls::get_gas_limits()).await?;
        let tokens = decode(
            &[
                ParamType::Uint(256),
                ParamType::Uint(256),
                ParamType::Uint(256),
            ],
            &out,
        )
        .map_err(|e| Error::Chain(format!("getGasLimits decode: {e}")))?;
        let mut it = tokens.into_iter();
        Ok(PaymasterGasLimits {
            acceptance_budget: it.next().and_then(|t| t.into_uint()).unwrap_or_default(),
            pre_relayed_call_gas_limit: it.next().and_then(|t| t.into_uint()).unwrap_or_default(),
            post_relayed_call_gas_limit: it.next().and_then(|t| t.into_uint()).unwrap_or_default(),
        })
    }

    async fn hub_max_charge(
        &self,
        max_gas: U256,
        gas_price: U256,
        fees: &RelayFees,
    ) -> Result<U256, Error> {
        let out = self
            .eth_call(self.hub, calls::calculate_charge(max_gas, gas_price, fees))
            .await?;
        let tokens = decode(&[ParamType::Uint(256)], &out)
            .map_err(|e| Error::Chain(format!("calculateCharge decode: {e}")))?;
        Ok(tokens
            .into_iter()
            .next()
            .and_then(|t| t.into_uint())
            .unwrap_or_default())
    }

    async fn simulate_relay_call(
        &self,
        from: Address,
        request: &RelayTransactionRequest,
        acceptance_budget: U256,
        max_possible_gas: U256,
    ) -> Result<RelayCallView, Error> {
        let data = calls::relay_call(acceptance_budget, request, max_possible_gas);
        let out = self.eth_call_from(from, self.hub, data).await?;
        let tokens = decode(&[ParamType::Bool, ParamType::Bytes], &out)
            .map_err(|e| Error::Chain(format!("relayCall view decode: {e}")))?;
        let mut it = tokens.into_iter();
        let paymaster_accepted = it.next().and_then(|t| t.into_bool()).unwrap_or(false);
        let return_value = it
            .next()
            .and_then(|t| t.into_bytes())
            .map(Bytes::from)
            .unwrap_or_default();
        Ok(RelayCallView {
            paymaster_accepted,
            return_value,
        })
    }
}
