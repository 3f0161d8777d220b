//! In-memory [`WalletStore`] for tests and embedders that persist
//! elsewhere.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use bitcoin::secp256k1::PublicKey;
use bitcoin::{Network, Transaction, Txid};

use super::models::{ChainState, DerivedAddress, TxRecord, Utxo};
use super::WalletStore;
use crate::account::keys::KeyChain;
use crate::error::StorageError;

#[derive(Default)]
struct Inner {
    addresses: BTreeMap<(KeyChain, u32), DerivedAddress>,
    by_address: HashMap<String, (KeyChain, u32)>,
    chains: HashMap<KeyChain, ChainState>,
    txs: HashMap<Txid, TxRecord>,
    utxos: Vec<Utxo>,
}

pub struct MemoryStore {
    network: Network,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means a writer panicked mid-update; the data is
        // value-typed, so continue with what is there.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a transaction (confirmed or not). Sync layers feed the store
    /// through this.
    pub fn insert_record(&self, record: TxRecord) {
        self.lock().txs.insert(record.txid(), record);
    }

    pub fn insert_utxo(&self, utxo: Utxo) {
        self.lock().utxos.push(utxo);
    }

    pub fn remove_utxo(&self, outpoint: &bitcoin::OutPoint) {
        self.lock().utxos.retain(|u| &u.outpoint != outpoint);
    }
}

impl WalletStore for MemoryStore {
    fn add_addresses(&self, batch: &[DerivedAddress]) -> Result<(), StorageError> {
        let mut inner = self.lock();
        for entry in batch {
            let key = (entry.chain, entry.index);
            inner
                .by_address
                .insert(entry.address(self.network).to_string(), key);
            inner.addresses.insert(key, entry.clone());
        }
        Ok(())
    }

    fn generated_count(&self, chain: KeyChain) -> Result<u32, StorageError> {
        let inner = self.lock();
        Ok(inner.addresses.keys().filter(|(c, _)| *c == chain).count() as u32)
    }

    fn issued_index(&self, chain: KeyChain) -> Result<Option<u32>, StorageError> {
        Ok(self.lock().chains.get(&chain).and_then(|s| s.issued))
    }

    fn set_issued_index(&self, chain: KeyChain, index: u32) -> Result<(), StorageError> {
        self.lock().chains.entry(chain).or_default().issued = Some(index);
        Ok(())
    }

    fn address_at(
        &self,
        chain: KeyChain,
        index: u32,
    ) -> Result<Option<DerivedAddress>, StorageError> {
        Ok(self.lock().addresses.get(&(chain, index)).cloned())
    }

    fn find_address(&self, address: &str) -> Result<Option<DerivedAddress>, StorageError> {
        let inner = self.lock();
        Ok(inner
            .by_address
            .get(address)
            .and_then(|key| inner.addresses.get(key))
            .cloned())
    }

    fn set_sync_complete(&self, chain: KeyChain, index: u32) -> Result<(), StorageError> {
        if let Some(entry) = self.lock().addresses.get_mut(&(chain, index)) {
            entry.sync_complete = true;
        }
        Ok(())
    }

    fn external_pubkeys(&self) -> Result<Vec<PublicKey>, StorageError> {
        let inner = self.lock();
        Ok(inner
            .addresses
            .values()
            .filter(|a| a.chain == KeyChain::External)
            .map(|a| a.pub_key)
            .collect())
    }

    fn unspent_outputs(&self) -> Result<Vec<Utxo>, StorageError> {
        Ok(self.lock().utxos.clone())
    }

    fn unspent_outputs_for_chain(&self, chain: KeyChain) -> Result<Vec<Utxo>, StorageError> {
        Ok(self
            .lock()
            .utxos
            .iter()
            .filter(|u| u.chain == chain)
            .cloned()
            .collect())
    }

    fn unconfirmed_records(&self) -> Result<Vec<TxRecord>, StorageError> {
        Ok(self
            .lock()
            .txs
            .values()
            .filter(|r| r.is_unconfirmed())
            .cloned()
            .collect())
    }

    fn transaction(&self, txid: &Txid) -> Result<Option<Transaction>, StorageError> {
        Ok(self.lock().txs.get(txid).map(|r| r.tx.clone()))
    }

    fn confirmed_balance(&self) -> Result<u64, StorageError> {
        Ok(self
            .lock()
            .utxos
            .iter()
            .filter(|u| u.confirmed)
            .map(|u| u.value)
            .sum())
    }
}
