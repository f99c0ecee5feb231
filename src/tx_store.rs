//! Durable journal of submitted transactions.
//!
//! Every broadcast transaction is recorded here keyed by `(from, nonce)`.
//! Replaying unfinished nonces from this journal is how the server recovers
//! after a restart, so the store must survive crashes.

use crate::error::Error;
use ethers::types::{Address, Bytes, H256, U256};
use rocksdb::{ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded, Options};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

const CF_TXS: &str = "txs";

/// Why a transaction was sent. The pending set of actions gates duplicate
/// submissions (one in-flight withdrawal, one in-flight worker refill, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerAction {
    RegisterServer,
    AddWorker,
    AuthorizeHub,
    Stake,
    Unstake,
    RelayCall,
    ValueTransfer,
    DepositWithdrawal,
    SetOwner,
}

/// Immutable record written at broadcast time. A boost replaces the record
/// under the same `(from, nonce)` with a new hash and gas price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTransaction {
    pub tx_hash: H256,
    pub from: Address,
    pub to: Address,
    pub nonce: u64,
    pub gas_price: U256,
    pub gas_limit: U256,
    pub value: U256,
    pub data: Bytes,
    pub creation_block_number: u64,
    pub creation_timestamp: u64,
    pub server_action: ServerAction,
    pub mined_block_number: Option<u64>,
}

impl StoredTransaction {
    pub fn is_mined(&self) -> bool {
        self.mined_block_number.is_some()
    }
}

pub trait TxStore: Send + Sync {
    /// Insert or replace the record at `(tx.from, tx.nonce)`.
    fn put(&self, tx: &StoredTransaction) -> Result<(), Error>;
    /// All records for `from`, nonce ascending.
    fn all_by_signer(&self, from: Address) -> Result<Vec<StoredTransaction>, Error>;
    /// First record for `from` with no mined block.
    fn oldest_pending(&self, from: Address) -> Result<Option<StoredTransaction>, Error>;
    /// True iff some unmined record carries `action` (optionally restricted
    /// to one signer).
    fn is_action_pending(
        &self,
        action: ServerAction,
        signer: Option<Address>,
    ) -> Result<bool, Error>;
    /// Delete all mined records for `from` with nonce <= `nonce`. Returns the
    /// number of deleted records.
    fn remove_txs_until_nonce(&self, from: Address, nonce: u64) -> Result<usize, Error>;
    /// Every signer with at least one record.
    fn signers(&self) -> Result<Vec<Address>, Error>;
}

// ── RocksDB-backed implementation ────────────────────────────────────────

/// Embedded journal. Keys are `signer-hex ++ be64(nonce)` so a prefix scan
/// yields one signer's records in nonce order.
pub struct RocksTxStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

fn record_key(from: Address, nonce: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(28);
    key.extend_from_slice(from.as_bytes());
    key.extend_from_slice(&nonce.to_be_bytes());
    key
}

impl RocksTxStore {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let cf_descriptors = vec![ColumnFamilyDescriptor::new(CF_TXS, Options::default())];
        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| Error::Store(format!("failed to open tx store: {e}")))?;
        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self) -> Result<Arc<rocksdb::BoundColumnFamily<'_>>, Error> {
        self.db
            .cf_handle(CF_TXS)
            .ok_or_else(|| Error::Store("missing txs column family".into()))
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<StoredTransaction>, Error> {
        let cf = self.cf()?;
        let mut out = Vec::new();
        for item in self.db.prefix_iterator_cf(&cf, prefix) {
            let (key, value) = item.map_err(|e| Error::Store(format!("iterator: {e}")))?;
            if !key.starts_with(prefix) {
                break;
            }
            let tx: StoredTransaction = serde_json::from_slice(&value)
                .map_err(|e| Error::Store(format!("corrupt record: {e}")))?;
            out.push(tx);
        }
        Ok(out)
    }
}

impl TxStore for RocksTxStore {
    fn put(&self, tx: &StoredTransaction) -> Result<(), Error> {
        let cf = self.cf()?;
        let value = serde_json::to_vec(tx)
            .map_err(|e| Error::Store(format!("failed to serialize record: {e}")))?;
        self.db
            .put_cf(&cf, record_key(tx.from, tx.nonce), value)
            .map_err(|e| Error::Store(format!("put: {e}")))
    }

    fn all_by_signer(&self, from: Address) -> Result<Vec<StoredTransaction>, Error> {
        self.scan_prefix(from.as_bytes())
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
        let records = match signer {
            Some(from) => self.all_by_signer(from)?,
            None => {
                let cf = self.cf()?;
                let mut all = Vec::new();
                for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
                    let (_, value) = item.map_err(|e| Error::Store(format!("iterator: {e}")))?;
                    let tx: StoredTransaction = serde_json::from_slice(&value)
                        .map_err(|e| Error::Store(format!("corrupt record: {e}")))?;
                    all.push(tx);
                }
                all
            }
        };
        Ok(records
            .iter()
            .any(|tx| !tx.is_mined() && tx.server_action == action))
    }

    fn remove_txs_until_nonce(&self, from: Address, nonce: u64) -> Result<usize, Error> {
        let cf = self.cf()?;
        let mut removed = 0;
        for tx in self.all_by_signer(from)? {
            if tx.nonce > nonce {
                break;
            }
            if !tx.is_mined() {
                continue;
            }
            self.db
                .delete_cf(&cf, record_key(from, tx.nonce))
                .map_err(|e| Error::Store(format!("delete: {e}")))?;
            removed += 1;
        }
        Ok(removed)
    }

    fn signers(&self) -> Result<Vec<Address>, Error> {
        let cf = self.cf()?;
        let mut signers = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| Error::Store(format!("iterator: {e}")))?;
            if key.len() < 20 {
                continue;
            }
            let addr = Address::from_slice(&key[..20]);
            if signers.last() != Some(&addr) {
                signers.push(addr);
            }
        }
        Ok(signers)
    }
}
