//! Key custody and transaction signing.
//!
//! The server uses two signers from the same store: index 0 is the manager
//! (registers and funds), index 1 is the worker (signs relay transactions).

use crate::error::Error;
use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes};
use rand::thread_rng;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{info, warn};

pub const MANAGER_INDEX: usize = 0;
pub const WORKER_INDEX: usize = 1;

#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Address of the signer at `index`, if present.
    fn address(&self, index: usize) -> Option<Address>;
    /// Sign `tx` with the key owning `from`; returns the raw signed RLP.
    async fn sign(&self, from: Address, tx: &TypedTransaction) -> Result<Bytes, Error>;
}

/// File-backed key store. Secret keys live in a JSON file written with an
/// atomic tmp+rename; missing keys are generated in dev mode only.
pub struct LocalKeyStore {
    wallets: Vec<LocalWallet>,
    by_address: HashMap<Address, usize>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct StoredKeys {
    keys: Vec<String>,
}

impl LocalKeyStore {
    /// Load signers from `path`, binding them to `chain_id`. When the file is
    /// missing, dev mode generates and persists a manager and a worker key;
    /// otherwise startup fails.
    pub fn load(path: impl Into<PathBuf>, chain_id: u64, dev_mode: bool) -> Result<Self, Error> {
        let path = path.into();
        let secrets = if path.exists() {
            let data = std::fs::read(&path)
                .map_err(|e| Error::Config(format!("failed to read keystore: {e}")))?;
            let stored: StoredKeys = serde_json::from_slice(&data)
                .map_err(|e| Error::Config(format!("failed to parse keystore: {e}")))?;
            info!(path = %path.display(), count = stored.keys.len(), "keystore loaded");
            stored.keys
        } else if dev_mode {
            warn!(path = %path.display(), "no keystore found, generating manager and worker keys");
            let generated: Vec<String> = (0..2)
                .map(|_| {
                    let wallet = LocalWallet::new(&mut thread_rng());
                    hex::encode(wallet.signer().to_bytes())
                })
                .collect();
            Self::persist(&path, &generated)?;
            generated
        } else {
            return Err(Error::Config(format!(
                "keystore not found at {}",
                path.display()
            )));
        };

        if secrets.len() < 2 {
            return Err(Error::Config(
                "keystore must hold a manager and a worker key".into(),
            ));
        }

        Self::from_secrets(&secrets, chain_id)
    }

    /// In-memory store with `count` freshly generated keys. Used by tests and
    /// never persisted.
    pub fn ephemeral(count: usize, chain_id: u64) -> Self {
        let secrets: Vec<String> = (0..count)
            .map(|_| hex::encode(LocalWallet::new(&mut thread_rng()).signer().to_bytes()))
            .collect();
        Self::from_secrets(&secrets, chain_id).expect("generated keys are valid")
    }

    fn from_secrets(secrets: &[String], chain_id: u64) -> Result<Self, Error> {
        let mut wallets = Vec::with_capacity(secrets.len());
        let mut by_address = HashMap::new();
        for (i, secret) in secrets.iter().enumerate() {
            let raw = hex::decode(secret.trim_start_matches("0x"))
                .map_err(|e| Error::Config(format!("invalid secret key hex at index {i}: {e}")))?;
            let wallet = LocalWallet::from_bytes(&raw)
                .map_err(|e| Error::Config(format!("invalid secret key at index {i}: {e}")))?
                .with_chain_id(chain_id);
            by_address.insert(wallet.address(), i);
            wallets.push(wallet);
        }
        Ok(Self {
            wallets,
            by_address,
        })
    }

    fn persist(path: &PathBuf, keys: &[String]) -> Result<(), Error> {
        let json = serde_json::to_string_pretty(&StoredKeys {
            keys: keys.to_vec(),
        })
        .map_err(|e| Error::Config(format!("failed to serialize keystore: {e}")))?;

        let tmp = path.with_extension("tmp");
        if let Some(parent) = tmp.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("failed to create keystore directory: {e}")))?;
        }
        std::fs::write(&tmp, json.as_bytes())
            .map_err(|e| Error::Config(format!("failed to write keystore: {e}")))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| Error::Config(format!("failed to rename keystore: {e}")))?;
        info!(path = %path.display(), count = keys.len(), "keystore saved");
        Ok(())
    }
}

#[async_trait]
impl KeyStore for LocalKeyStore {
    fn address(&self, index: usize) -> Option<Address> {
        self.wallets.get(index).map(|w| w.address())
    }

    async fn sign(&self, from: Address, tx: &TypedTransaction) -> Result<Bytes, Error> {
        let index = self
            .by_address
            .get(&from)
            .ok_or_else(|| Error::Signer(format!("no key for signer {from:?}")))?;
        let wallet = &self.wallets[*index];
        let signature = wallet
            .sign_transaction_sync(tx)
            .map_err(|e| Error::Signer(format!("signing failed for {from:?}: {e}")))?;
        Ok(tx.rlp_signed(&signature))
    }
}
