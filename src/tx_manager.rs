//! Transaction manager: nonce allocation, signing, broadcast, gas-price
//! boosting and confirmation pruning.
//!
//! All mutating traffic for a signer runs through its mutex: the critical
//! section {allocate nonce, sign, broadcast, persist} must not interleave,
//! and a boost must not race a fresh submission. If a broadcast hangs the
//! signer stalls; stalling is safer than a nonce race.

use crate::chain::ChainAccess;
use crate::config::Config;
use crate::error::Error;
use crate::keys::KeyStore;
use crate::tx_store::{ServerAction, StoredTransaction, TxStore};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionRequest, H256, U256};
use ethers::utils::keccak256;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex as SignerMutex;
use tracing::{debug, info, warn};

/// Margin added on top of `eth_estimateGas`, in percent.
const ESTIMATE_GAS_MARGIN_PCT: u64 = 10;

/// Everything needed to sign and broadcast one transaction.
#[derive(Debug, Clone)]
pub struct SendTransactionDetails {
    pub signer: Address,
    pub action: ServerAction,
    pub to: Address,
    pub value: U256,
    pub gas_limit: U256,
    pub gas_price: U256,
    pub data: Bytes,
    pub creation_block_number: u64,
}

pub struct TransactionManager {
    chain: Arc<dyn ChainAccess>,
    keys: Arc<dyn KeyStore>,
    store: Arc<dyn TxStore>,
    config: Arc<Config>,
    chain_id: u64,
    signer_locks: StdMutex<HashMap<Address, Arc<SignerMutex<()>>>>,
}

/// Multiply a gas price by a scalar factor, flooring the result.
pub(crate) fn mul_factor(value: U256, factor: f64) -> U256 {
    let scaled = (factor * 1000.0).round() as u64;
    value * U256::from(scaled) / U256::from(1000u64)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl TransactionManager {
    pub fn new(
        chain: Arc<dyn ChainAccess>,
        keys: Arc<dyn KeyStore>,
        store: Arc<dyn TxStore>,
        config: Arc<Config>,
        chain_id: u64,
    ) -> Self {
        Self {
            chain,
            keys,
            store,
            config,
            chain_id,
            signer_locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn TxStore> {
        &self.store
    }

    fn signer_lock(&self, signer: Address) -> Arc<SignerMutex<()>> {
        let mut locks = self.signer_locks.lock().unwrap();
        Arc::clone(locks.entry(signer).or_default())
    }

    /// Next nonce for `signer`: the max of the chain-reported pending nonce
    /// and one past the highest journaled nonce. The journal side covers
    /// transactions the mempool may have dropped.
    pub async fn poll_nonce(&self, signer: Address) -> Result<u64, Error> {
        let chain_nonce = self.chain.pending_nonce(signer).await?;
        let stored_next = self
            .store
            .all_by_signer(signer)?
            .last()
            .map(|tx| tx.nonce + 1)
            .unwrap_or(0);
        Ok(chain_nonce.max(stored_next))
    }

    /// Allocate a nonce, sign, broadcast, persist, in that order. A crash
    /// between broadcast and persist is recovered by the next `poll_nonce`
    /// observing the chain-side bump.
    pub async fn send_transaction(
        &self,
        details: SendTransactionDetails,
    ) -> Result<(H256, Bytes), Error> {
        let lock = self.signer_lock(details.signer);
        let _guard = lock.lock().await;

        let nonce = self.poll_nonce(details.signer).await?;
        let (tx_hash, raw) = self
            .sign_and_broadcast(&details, nonce, details.gas_price)
            .await?;

        self.store.put(&StoredTransaction {
            tx_hash,
            from: details.signer,
            to: details.to,
            nonce,
            gas_price: details.gas_price,
            gas_limit: details.gas_limit,
            value: details.value,
            data: details.data.clone(),
            creation_block_number: details.creation_block_number,
            creation_timestamp: now_secs(),
            server_action: details.action,
            mined_block_number: None,
        })?;

        info!(
            signer = ?details.signer,
            nonce,
            action = ?details.action,
            tx_hash = ?tx_hash,
            "transaction broadcast"
        );
        Ok((tx_hash, raw))
    }

    async fn sign_and_broadcast(
        &self,
        details: &SendTransactionDetails,
        nonce: u64,
        gas_price: U256,
    ) -> Result<(H256, Bytes), Error> {
        let tx: TypedTransaction = TransactionRequest::new()
            .from(details.signer)
            .to(details.to)
            .value(details.value)
            .gas(details.gas_limit)
            .gas_price(gas_price)
            .data(details.data.clone())
            .nonce(nonce)
            .chain_id(self.chain_id)
            .into();

        let raw = self.keys.sign(details.signer, &tx).await?;
        let tx_hash = H256::from(keccak256(&raw));

        let reported = self.chain.send_raw_transaction(raw.clone()).await?;
        if reported != tx_hash {
            warn!(local = ?tx_hash, reported = ?reported, "node reported unexpected tx hash");
        }
        Ok((tx_hash, raw))
    }

    /// Re-sign the oldest unmined transaction of `signer` at a higher gas
    /// price if it has been stuck longer than the pending timeout. The nonce
    /// is never changed: exactly one on-chain slot is contended until the
    /// transaction is mined or replaced.
    pub async fn boost_oldest_pending_transaction_for_signer(
        &self,
        signer: Address,
        current_block: u64,
    ) -> Result<Option<H256>, Error> {
        let lock = self.signer_lock(signer);
        let _guard = lock.lock().await;

        let Some(oldest) = self.store.oldest_pending(signer)? else {
            return Ok(None);
        };
        let age = current_block.saturating_sub(oldest.creation_block_number);
        if age < self.config.pending_transaction_timeout_blocks {
            debug!(signer = ?signer, nonce = oldest.nonce, age, "pending tx not stuck yet");
            return Ok(None);
        }

        let network = self.chain.gas_price().await?;
        let mut boosted = network.max(mul_factor(
            oldest.gas_price,
            self.config.retry_gas_price_factor,
        ));
        let cap = U256::from(self.config.max_gas_price);
        if boosted > cap {
            boosted = cap;
        }
        if boosted <= oldest.gas_price {
            warn!(
                signer = ?signer,
                nonce = oldest.nonce,
                gas_price = %oldest.gas_price,
                "stuck tx already at max gas price, not boosting"
            );
            return Ok(None);
        }

        let details = SendTransactionDetails {
            signer,
            action: oldest.server_action,
            to: oldest.to,
            value: oldest.value,
            gas_limit: oldest.gas_limit,
            gas_price: boosted,
            data: oldest.data.clone(),
            creation_block_number: current_block,
        };
        let (tx_hash, _raw) = self
            .sign_and_broadcast(&details, oldest.nonce, boosted)
            .await?;

        self.store.put(&StoredTransaction {
            tx_hash,
            gas_price: boosted,
            creation_block_number: current_block,
            ..oldest.clone()
        })?;

        info!(
            signer = ?signer,
            nonce = oldest.nonce,
            old_gas_price = %oldest.gas_price,
            new_gas_price = %boosted,
            tx_hash = ?tx_hash,
            "boosted stuck transaction"
        );
        Ok(Some(tx_hash))
    }

    /// Fill in mined block numbers for journaled transactions that now have
    /// receipts.
    pub async fn update_mined_status(&self) -> Result<(), Error> {
        for signer in self.store.signers()? {
            for tx in self.store.all_by_signer(signer)? {
                if tx.is_mined() {
                    continue;
                }
                if let Some(block) = self.chain.transaction_mined_block(tx.tx_hash).await? {
                    self.store.put(&StoredTransaction {
                        mined_block_number: Some(block),
                        ..tx
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Compact the journal: per signer, drop the contiguous run of lowest
    /// nonces mined at sufficient depth. A gap (an unmined or shallow record)
    /// halts pruning for that signer, since a later nonce being confirmed
    /// says nothing about an earlier one still in flight.
    pub async fn remove_confirmed_transactions(&self, current_block: u64) -> Result<(), Error> {
        self.update_mined_status().await?;

        for signer in self.store.signers()? {
            let mut confirmed_up_to: Option<u64> = None;
            for tx in self.store.all_by_signer(signer)? {
                match tx.mined_block_number {
                    Some(mined)
                        if current_block.saturating_sub(mined) + 1
                            >= self.config.confirmations_needed =>
                    {
                        confirmed_up_to = Some(tx.nonce);
                    }
                    _ => break,
                }
            }
            if let Some(nonce) = confirmed_up_to {
                let removed = self.store.remove_txs_until_nonce(signer, nonce)?;
                debug!(signer = ?signer, up_to_nonce = nonce, removed, "pruned confirmed txs");
            }
        }
        Ok(())
    }

    /// Estimate gas for a call, with a fixed margin. A revert during
    /// estimation surfaces as an error naming the operation.
    pub async fn attempt_estimate_gas(
        &self,
        label: &str,
        from: Address,
        to: Address,
        data: Bytes,
    ) -> Result<U256, Error> {
        let estimate = self
            .chain
            .estimate_gas(from, to, data)
            .await
            .map_err(|e| Error::Chain(format!("gas estimate for {label} failed: {e}")))?;
        Ok(estimate * U256::from(100 + ESTIMATE_GAS_MARGIN_PCT) / U256::from(100u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::LocalKeyStore;
    use crate::testutil::{MemTxStore, MockChain};

    const CHAIN_ID: u64 = 1337;

    struct Fixture {
        chain: Arc<MockChain>,
        store: Arc<MemTxStore>,
        manager: TransactionManager,
        signer: Address,
    }

    fn fixture(config: Config) -> Fixture {
        let chain = Arc::new(MockChain::new());
        let store = Arc::new(MemTxStore::new());
        let keys = Arc::new(LocalKeyStore::ephemeral(2, CHAIN_ID));
        let signer = keys.address(0).unwrap();
        let manager = TransactionManager::new(
            chain.clone() as Arc<dyn ChainAccess>,
            keys,
            store.clone() as Arc<dyn TxStore>,
            Arc::new(config),
            CHAIN_ID,
        );
        Fixture {
            chain,
            store,
            manager,
            signer,
        }
    }

    fn details(signer: Address, block: u64) -> SendTransactionDetails {
        SendTransactionDetails {
            signer,
            action: ServerAction::RelayCall,
            to: Address::repeat_byte(0x42),
            value: U256::zero(),
            gas_limit: U256::from(100_000u64),
            gas_price: U256::from(20u64),
            data: Bytes::from(vec![1, 2, 3]),
            creation_block_number: block,
        }
    }

    #[tokio::test]
    async fn nonces_are_dense_and_persisted() {
        let f = fixture(Config::default());
        for _ in 0..3 {
            f.manager.send_transaction(details(f.signer, 100)).await.unwrap();
        }
        let nonces: Vec<u64> = f
            .store
            .all_by_signer(f.signer)
            .unwrap()
            .iter()
            .map(|tx| tx.nonce)
            .collect();
        assert_eq!(nonces, vec![0, 1, 2]);
        assert_eq!(f.chain.sent_count(), 3);
    }

    #[tokio::test]
    async fn poll_nonce_takes_max_of_chain_and_journal() {
        let f = fixture(Config::default());
        f.chain.set_pending_nonce(f.signer, 5);
        assert_eq!(f.manager.poll_nonce(f.signer).await.unwrap(), 5);

        f.manager.send_transaction(details(f.signer, 100)).await.unwrap();
        // journal now holds nonce 5; chain still reports 5
        assert_eq!(f.manager.poll_nonce(f.signer).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn boost_replaces_record_in_place() {
        let mut config = Config::default();
        config.pending_transaction_timeout_blocks = 30;
        config.retry_gas_price_factor = 1.2;
        let f = fixture(config);
        f.chain.set_gas_price(U256::from(10u64));

        f.manager.send_transaction(details(f.signer, 200)).await.unwrap();
        let before = f.store.all_by_signer(f.signer).unwrap()[0].clone();

        // not stuck yet at block 229
        assert!(f
            .manager
            .boost_oldest_pending_transaction_for_signer(f.signer, 229)
            .await
            .unwrap()
            .is_none());

        let boosted_hash = f
            .manager
            .boost_oldest_pending_transaction_for_signer(f.signer, 231)
            .await
            .unwrap()
            .unwrap();

        let after = f.store.all_by_signer(f.signer).unwrap();
        assert_eq!(after.len(), 1);
        let after = &after[0];
        assert_eq!(after.nonce, before.nonce);
        assert_eq!(after.tx_hash, boosted_hash);
        assert_ne!(after.tx_hash, before.tx_hash);
        // max(network=10, 20 * 1.2) = 24
        assert_eq!(after.gas_price, U256::from(24u64));
    }

    #[tokio::test]
    async fn boost_respects_max_gas_price() {
        let mut config = Config::default();
        config.pending_transaction_timeout_blocks = 0;
        config.max_gas_price = 21;
        let f = fixture(config);
        f.chain.set_gas_price(U256::from(10u64));

        f.manager.send_transaction(details(f.signer, 0)).await.unwrap();
        // first boost hits the cap at 21
        f.manager
            .boost_oldest_pending_transaction_for_signer(f.signer, 100)
            .await
            .unwrap()
            .unwrap();
        // second boost has nowhere to go
        assert!(f
            .manager
            .boost_oldest_pending_transaction_for_signer(f.signer, 200)
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            f.store.all_by_signer(f.signer).unwrap()[0].gas_price,
            U256::from(21u64)
        );
    }

    #[tokio::test]
    async fn pruning_stops_at_unconfirmed_gap() {
        let mut config = Config::default();
        config.confirmations_needed = 12;
        let f = fixture(config);

        let hashes: Vec<H256> = {
            let mut out = Vec::new();
            for _ in 0..3 {
                let (hash, _) =
                    f.manager.send_transaction(details(f.signer, 100)).await.unwrap();
                out.push(hash);
            }
            out
        };

        // nonce 0 mined deep, nonce 1 unmined, nonce 2 mined deep
        f.chain.set_mined(hashes[0], 100);
        f.chain.set_mined(hashes[2], 100);

        f.manager.remove_confirmed_transactions(200).await.unwrap();
        let left: Vec<u64> = f
            .store
            .all_by_signer(f.signer)
            .unwrap()
            .iter()
            .map(|tx| tx.nonce)
            .collect();
        // nonce 0 pruned, the gap at 1 protects 2
        assert_eq!(left, vec![1, 2]);
    }

    #[tokio::test]
    async fn pruning_respects_confirmation_depth() {
        let mut config = Config::default();
        config.confirmations_needed = 12;
        let f = fixture(config);

        let (hash, _) = f.manager.send_transaction(details(f.signer, 100)).await.unwrap();
        f.chain.set_mined(hash, 195);

        // depth 200-195+1 = 6 < 12: kept
        f.manager.remove_confirmed_transactions(200).await.unwrap();
        assert_eq!(f.store.all_by_signer(f.signer).unwrap().len(), 1);

        // depth 210-195+1 = 16 >= 12: pruned
        f.manager.remove_confirmed_transactions(210).await.unwrap();
        assert!(f.store.all_by_signer(f.signer).unwrap().is_empty());
    }

    #[tokio::test]
    async fn broadcast_failure_bubbles_without_journaling() {
        let f = fixture(Config::default());
        f.chain.set_send_error(Some("insufficient funds for gas * price + value"));

        let err = f
            .manager
            .send_transaction(details(f.signer, 100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Chain(_)));
        // Nothing persisted: the record is written only after a broadcast
        // that was accepted by the node.
        assert!(f.store.all_by_signer(f.signer).unwrap().is_empty());

        // The nonce is re-derived cleanly once the node recovers.
        f.chain.set_send_error(None);
        f.manager.send_transaction(details(f.signer, 101)).await.unwrap();
        assert_eq!(f.store.all_by_signer(f.signer).unwrap()[0].nonce, 0);
    }

    #[tokio::test]
    async fn estimate_adds_margin_and_names_failures() {
        let f = fixture(Config::default());
        f.chain.set_estimate_gas(Ok(U256::from(100_000u64)));
        let est = f
            .manager
            .attempt_estimate_gas("register", f.signer, Address::zero(), Bytes::new())
            .await
            .unwrap();
        assert_eq!(est, U256::from(110_000u64));

        f.chain.set_estimate_gas(Err("execution reverted".into()));
        let err = f
            .manager
            .attempt_estimate_gas("register", f.signer, Address::zero(), Bytes::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("register"));
    }

    #[test]
    fn mul_factor_floors() {
        assert_eq!(mul_factor(U256::from(20u64), 1.2), U256::from(24u64));
        assert_eq!(mul_factor(U256::from(21u64), 1.2), U256::from(25u64)); // 25.2 floored
        assert_eq!(mul_factor(U256::from(10u64), 1.0), U256::from(10u64));
    }
}
