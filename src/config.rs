//! Relay server configuration.
//!
//! All balances are wei, all gas prices are wei per gas, all delays are
//! milliseconds unless the field name says blocks.

use ethers::types::Address;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "defaults::rpc_url")]
    pub rpc_url: String,

    #[serde(default = "defaults::bind_address")]
    pub bind_address: String,

    /// Relay hub contract this server fronts.
    #[serde(default = "defaults::relay_hub_address")]
    pub relay_hub_address: Address,

    /// Expected owner of the manager's stake. A foreign owner observed
    /// on-chain is fatal.
    #[serde(default = "defaults::owner_address")]
    pub owner_address: Address,

    /// Paymasters whose gas limits are assumed honest; bypass the
    /// acceptance-budget cap and the fee floor.
    #[serde(default)]
    pub trusted_paymasters: Vec<Address>,

    /// URL advertised on registration.
    #[serde(default = "defaults::relay_url")]
    pub relay_url: String,

    // -- Economics --
    #[serde(default = "defaults::gas_price_factor")]
    pub gas_price_factor: f64,
    #[serde(default = "defaults::pct_relay_fee")]
    pub pct_relay_fee: u64,
    #[serde(default = "defaults::base_relay_fee")]
    pub base_relay_fee: u128,
    #[serde(default = "defaults::max_acceptance_budget")]
    pub max_acceptance_budget: u128,
    #[serde(default = "defaults::max_gas_price")]
    pub max_gas_price: u128,
    /// Gas overhead charged by the hub on top of the inner call.
    #[serde(default = "defaults::hub_overhead_gas")]
    pub hub_overhead_gas: u64,

    // -- Balances (wei) --
    #[serde(default = "defaults::manager_min_balance")]
    pub manager_min_balance: u128,
    #[serde(default = "defaults::manager_target_balance")]
    pub manager_target_balance: u128,
    #[serde(default = "defaults::min_hub_withdrawal_balance")]
    pub min_hub_withdrawal_balance: u128,
    #[serde(default = "defaults::worker_min_balance")]
    pub worker_min_balance: u128,
    #[serde(default = "defaults::worker_target_balance")]
    pub worker_target_balance: u128,

    // -- Registration --
    /// Stake attached to `stakeForAddress` when the manager is unstaked.
    #[serde(default = "defaults::registration_stake")]
    pub registration_stake: u128,
    #[serde(default = "defaults::unstake_delay_blocks")]
    pub unstake_delay_blocks: u64,
    /// Re-register when this many blocks pass without a relay event.
    #[serde(default = "defaults::registration_block_rate")]
    pub registration_block_rate: u64,

    // -- Cadence --
    #[serde(default = "defaults::check_interval_ms")]
    pub check_interval_ms: u64,
    #[serde(default = "defaults::ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    #[serde(default = "defaults::refresh_state_timeout_blocks")]
    pub refresh_state_timeout_blocks: u64,
    #[serde(default = "defaults::confirmations_needed")]
    pub confirmations_needed: u64,
    #[serde(default = "defaults::pending_transaction_timeout_blocks")]
    pub pending_transaction_timeout_blocks: u64,
    #[serde(default = "defaults::retry_gas_price_factor")]
    pub retry_gas_price_factor: f64,
    #[serde(default = "defaults::successful_rounds_for_ready")]
    pub successful_rounds_for_ready: u32,

    // -- Alerted mode --
    #[serde(default = "defaults::alerted_block_delay")]
    pub alerted_block_delay: u64,
    #[serde(default = "defaults::min_alerted_delay_ms")]
    pub min_alerted_delay_ms: u64,
    #[serde(default = "defaults::max_alerted_delay_ms")]
    pub max_alerted_delay_ms: u64,

    // -- Storage / keys --
    #[serde(default = "defaults::keystore_path")]
    pub keystore_path: String,
    #[serde(default = "defaults::tx_store_path")]
    pub tx_store_path: String,

    /// Dev mode: auto-generate missing signer keys and relax startup checks.
    #[serde(default)]
    pub dev_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc_url: defaults::rpc_url(),
            bind_address: defaults::bind_address(),
            relay_hub_address: defaults::relay_hub_address(),
            owner_address: defaults::owner_address(),
            trusted_paymasters: Vec::new(),
            relay_url: defaults::relay_url(),
            gas_price_factor: defaults::gas_price_factor(),
            pct_relay_fee: defaults::pct_relay_fee(),
            base_relay_fee: defaults::base_relay_fee(),
            max_acceptance_budget: defaults::max_acceptance_budget(),
            max_gas_price: defaults::max_gas_price(),
            hub_overhead_gas: defaults::hub_overhead_gas(),
            manager_min_balance: defaults::manager_min_balance(),
            manager_target_balance: defaults::manager_target_balance(),
            min_hub_withdrawal_balance: defaults::min_hub_withdrawal_balance(),
            worker_min_balance: defaults::worker_min_balance(),
            worker_target_balance: defaults::worker_target_balance(),
            registration_stake: defaults::registration_stake(),
            unstake_delay_blocks: defaults::unstake_delay_blocks(),
            registration_block_rate: defaults::registration_block_rate(),
            check_interval_ms: defaults::check_interval_ms(),
            ready_timeout_ms: defaults::ready_timeout_ms(),
            refresh_state_timeout_blocks: defaults::refresh_state_timeout_blocks(),
            confirmations_needed: defaults::confirmations_needed(),
            pending_transaction_timeout_blocks: defaults::pending_transaction_timeout_blocks(),
            retry_gas_price_factor: defaults::retry_gas_price_factor(),
            successful_rounds_for_ready: defaults::successful_rounds_for_ready(),
            alerted_block_delay: defaults::alerted_block_delay(),
            min_alerted_delay_ms: defaults::min_alerted_delay_ms(),
            max_alerted_delay_ms: defaults::max_alerted_delay_ms(),
            keystore_path: defaults::keystore_path(),
            tx_store_path: defaults::tx_store_path(),
            dev_mode: false,
        }
    }
}

mod defaults {
    use ethers::types::Address;

    pub fn rpc_url() -> String {
        std::env::var("RELAYD_RPC_URL").unwrap_or_else(|_| "http://127.0.0.1:8545".into())
    }

    pub fn bind_address() -> String {
        "0.0.0.0:8090".into()
    }

    pub fn relay_hub_address() -> Address {
        Address::zero()
    }

    pub fn owner_address() -> Address {
        Address::zero()
    }

    pub fn relay_url() -> String {
        "http://localhost:8090".into()
    }

    pub fn gas_price_factor() -> f64 {
        1.0
    }

    pub fn pct_relay_fee() -> u64 {
        0
    }

    pub fn base_relay_fee() -> u128 {
        0
    }

    pub fn max_acceptance_budget() -> u128 {
        150_000
    }

    pub fn max_gas_price() -> u128 {
        500_000_000_000 // 500 gwei
    }

    pub fn hub_overhead_gas() -> u64 {
        35_000
    }

    pub fn manager_min_balance() -> u128 {
        100_000_000_000_000_000 // 0.1 eth
    }

    pub fn manager_target_balance() -> u128 {
        300_000_000_000_000_000
    }

    pub fn min_hub_withdrawal_balance() -> u128 {
        100_000_000_000_000_000
    }

    pub fn worker_min_balance() -> u128 {
        100_000_000_000_000_000
    }

    pub fn worker_target_balance() -> u128 {
        300_000_000_000_000_000
    }

    pub fn registration_stake() -> u128 {
        1_000_000_000_000_000_000 // 1 eth
    }

    pub fn unstake_delay_blocks() -> u64 {
        1000
    }

    pub fn registration_block_rate() -> u64 {
        0
    }

    pub fn check_interval_ms() -> u64 {
        10_000
    }

    pub fn ready_timeout_ms() -> u64 {
        30_000
    }

    pub fn refresh_state_timeout_blocks() -> u64 {
        5
    }

    pub fn confirmations_needed() -> u64 {
        12
    }

    pub fn pending_transaction_timeout_blocks() -> u64 {
        30
    }

    pub fn retry_gas_price_factor() -> f64 {
        1.2
    }

    pub fn successful_rounds_for_ready() -> u32 {
        3
    }

    pub fn alerted_block_delay() -> u64 {
        0
    }

    pub fn min_alerted_delay_ms() -> u64 {
        0
    }

    pub fn max_alerted_delay_ms() -> u64 {
        0
    }

    pub fn keystore_path() -> String {
        std::env::var("RELAYD_KEYSTORE_PATH").unwrap_or_else(|_| "./data/keystore.json".into())
    }

    pub fn tx_store_path() -> String {
        std::env::var("RELAYD_TX_STORE_PATH").unwrap_or_else(|_| "./data/txstore".into())
    }
}
