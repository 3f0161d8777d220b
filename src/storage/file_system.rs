//! JSON file-per-wallet [`WalletStore`]
//!
//! Layout under the base directory:
//!
//! ```text
//! <base>/<name>/metadata.json   — name, creation time, network
//! <base>/<name>/addresses.json  — all derived addresses
//! <base>/<name>/state.json      — per-chain issued indices
//! <base>/<name>/txs.json        — transaction records
//! <base>/<name>/utxos.json      — unspent outputs
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use bitcoin::secp256k1::PublicKey;
use bitcoin::{Network, Transaction, Txid};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::models::{ChainState, DerivedAddress, Metadata, TxRecord, Utxo};
use super::WalletStore;
use crate::account::keys::KeyChain;
use crate::error::StorageError;

pub struct FileStore {
    wallet_dir: PathBuf,
    network: Network,
    // Serializes read-modify-write cycles on the JSON files.
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Create a new wallet directory and empty data files.
    pub fn create(base: &PathBuf, name: &str, network: Network) -> Result<Self, StorageError> {
        let wallet_dir = base.join(name);
        if wallet_dir.exists() {
            return Err(StorageError::WalletExists(name.to_string()));
        }
        fs::create_dir_all(&wallet_dir)?;

        let store = Self {
            wallet_dir,
            network,
            write_lock: Mutex::new(()),
        };
        let metadata = Metadata {
            name: name.to_string(),
            created_at: Utc::now(),
            network: network.to_string(),
        };
        store.save("metadata.json", &metadata)?;
        store.save("addresses.json", &Vec::<DerivedAddress>::new())?;
        store.save("state.json", &HashMap::<KeyChain, ChainState>::new())?;
        store.save("txs.json", &Vec::<TxRecord>::new())?;
        store.save("utxos.json", &Vec::<Utxo>::new())?;
        Ok(store)
    }

    /// Open an existing wallet directory.
    pub fn open(base: &PathBuf, name: &str, network: Network) -> Result<Self, StorageError> {
        let wallet_dir = base.join(name);
        if !wallet_dir.exists() {
            return Err(StorageError::DirectoryNotFound(
                wallet_dir.display().to_string(),
            ));
        }
        Ok(Self {
            wallet_dir,
            network,
            write_lock: Mutex::new(()),
        })
    }

    pub fn exists(base: &PathBuf, name: &str) -> bool {
        base.join(name).exists()
    }

    /// List all wallet names in a base directory.
    pub fn list_wallets(base: &PathBuf) -> Result<Vec<String>, StorageError> {
        if !base.exists() {
            return Ok(Vec::new());
        }
        let mut wallets = Vec::new();
        for entry in fs::read_dir(base)? {
            let path = entry?.path();
            if path.is_dir() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    wallets.push(name.to_string());
                }
            }
        }
        Ok(wallets)
    }

    /// Delete a wallet and all its associated data from disk.
    pub fn delete(base: &PathBuf, name: &str) -> Result<(), StorageError> {
        let wallet_dir = base.join(name);
        if !wallet_dir.exists() {
            return Err(StorageError::DirectoryNotFound(
                wallet_dir.display().to_string(),
            ));
        }
        log::warn!("Deleting wallet directory: {:?}", wallet_dir);
        fs::remove_dir_all(&wallet_dir)?;
        Ok(())
    }

    pub fn metadata(&self) -> Result<Metadata, StorageError> {
        self.load("metadata.json")
    }

    /// Record a transaction (insert or replace by txid).
    pub fn insert_record(&self, record: TxRecord) -> Result<(), StorageError> {
        let _guard = self.lock();
        let mut records: Vec<TxRecord> = self.load("txs.json")?;
        let txid = record.txid();
        records.retain(|r| r.txid() != txid);
        records.push(record);
        self.save("txs.json", &records)
    }

    pub fn insert_utxo(&self, utxo: Utxo) -> Result<(), StorageError> {
        let _guard = self.lock();
        let mut utxos: Vec<Utxo> = self.load("utxos.json")?;
        utxos.push(utxo);
        self.save("utxos.json", &utxos)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn load<T: DeserializeOwned>(&self, file: &str) -> Result<T, StorageError> {
        let path = self.wallet_dir.join(file);
        if !path.exists() {
            return Err(StorageError::FileNotFound(path.display().to_string()));
        }
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn save<T: Serialize>(&self, file: &str, value: &T) -> Result<(), StorageError> {
        let path = self.wallet_dir.join(file);
        let json = serde_json::to_string_pretty(value)?;
        fs::write(path, json)?;
        Ok(())
    }

    fn load_addresses(&self) -> Result<Vec<DerivedAddress>, StorageError> {
        self.load("addresses.json")
    }
}

impl WalletStore for FileStore {
    fn add_addresses(&self, batch: &[DerivedAddress]) -> Result<(), StorageError> {
        let _guard = self.lock();
        let mut addresses = self.load_addresses()?;
        addresses.extend_from_slice(batch);
        self.save("addresses.json", &addresses)
    }

    fn generated_count(&self, chain: KeyChain) -> Result<u32, StorageError> {
        Ok(self
            .load_addresses()?
            .iter()
            .filter(|a| a.chain == chain)
            .count() as u32)
    }

    fn issued_index(&self, chain: KeyChain) -> Result<Option<u32>, StorageError> {
        let state: HashMap<KeyChain, ChainState> = self.load("state.json")?;
        Ok(state.get(&chain).and_then(|s| s.issued))
    }

    fn set_issued_index(&self, chain: KeyChain, index: u32) -> Result<(), StorageError> {
        let _guard = self.lock();
        let mut state: HashMap<KeyChain, ChainState> = self.load("state.json")?;
        state.entry(chain).or_default().issued = Some(index);
        self.save("state.json", &state)
    }

    fn address_at(
        &self,
        chain: KeyChain,
        index: u32,
    ) -> Result<Option<DerivedAddress>, StorageError> {
        Ok(self
            .load_addresses()?
            .into_iter()
            .find(|a| a.chain == chain && a.index == index))
    }

    fn find_address(&self, address: &str) -> Result<Option<DerivedAddress>, StorageError> {
        Ok(self
            .load_addresses()?
            .into_iter()
            .find(|a| a.address(self.network).to_string() == address))
    }

    fn set_sync_complete(&self, chain: KeyChain, index: u32) -> Result<(), StorageError> {
        let _guard = self.lock();
        let mut addresses = self.load_addresses()?;
        for entry in &mut addresses {
            if entry.chain == chain && entry.index == index {
                entry.sync_complete = true;
            }
        }
        self.save("addresses.json", &addresses)
    }

    fn external_pubkeys(&self) -> Result<Vec<PublicKey>, StorageError> {
        Ok(self
            .load_addresses()?
            .into_iter()
            .filter(|a| a.chain == KeyChain::External)
            .map(|a| a.pub_key)
            .collect())
    }

    fn unspent_outputs(&self) -> Result<Vec<Utxo>, StorageError> {
        self.load("utxos.json")
    }

    fn unspent_outputs_for_chain(&self, chain: KeyChain) -> Result<Vec<Utxo>, StorageError> {
        Ok(self
            .unspent_outputs()?
            .into_iter()
            .filter(|u| u.chain == chain)
            .collect())
    }

    fn unconfirmed_records(&self) -> Result<Vec<TxRecord>, StorageError> {
        let records: Vec<TxRecord> = self.load("txs.json")?;
        Ok(records.into_iter().filter(|r| r.is_unconfirmed()).collect())
    }

    fn transaction(&self, txid: &Txid) -> Result<Option<Transaction>, StorageError> {
        let records: Vec<TxRecord> = self.load("txs.json")?;
        Ok(records
            .into_iter()
            .find(|r| r.txid() == *txid)
            .map(|r| r.tx))
    }

    fn confirmed_balance(&self) -> Result<u64, StorageError> {
        Ok(self
            .unspent_outputs()?
            .iter()
            .filter(|u| u.confirmed)
            .map(|u| u.value)
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{rand, Secp256k1};

    fn sample_address(chain: KeyChain, index: u32) -> DerivedAddress {
        let secp = Secp256k1::new();
        let (_, pub_key) = secp.generate_keypair(&mut rand::thread_rng());
        DerivedAddress {
            pub_key,
            chain,
            index,
            sync_complete: false,
        }
    }

    #[test]
    fn test_create_open_delete() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_path_buf();

        let store = FileStore::create(&base, "alpha", Network::Regtest).unwrap();
        assert!(FileStore::exists(&base, "alpha"));
        assert!(FileStore::create(&base, "alpha", Network::Regtest).is_err());
        assert_eq!(store.metadata().unwrap().name, "alpha");
        assert_eq!(FileStore::list_wallets(&base).unwrap(), vec!["alpha"]);

        FileStore::delete(&base, "alpha").unwrap();
        assert!(!FileStore::exists(&base, "alpha"));
        assert!(FileStore::open(&base, "alpha", Network::Regtest).is_err());
    }

    #[test]
    fn test_addresses_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_path_buf();
        let store = FileStore::create(&base, "beta", Network::Regtest).unwrap();

        let entry = sample_address(KeyChain::External, 0);
        let addr = entry.address(Network::Regtest).to_string();
        store
            .add_addresses(&[entry, sample_address(KeyChain::Internal, 0)])
            .unwrap();

        assert_eq!(store.generated_count(KeyChain::External).unwrap(), 1);
        assert_eq!(store.generated_count(KeyChain::Internal).unwrap(), 1);

        let found = store.find_address(&addr).unwrap().unwrap();
        assert_eq!(found.chain, KeyChain::External);
        assert!(!found.sync_complete);

        store.set_sync_complete(KeyChain::External, 0).unwrap();
        let found = store.find_address(&addr).unwrap().unwrap();
        assert!(found.sync_complete);

        assert_eq!(store.external_pubkeys().unwrap().len(), 1);
    }

    #[test]
    fn test_issued_index_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_path_buf();
        let store = FileStore::create(&base, "gamma", Network::Regtest).unwrap();

        assert_eq!(store.issued_index(KeyChain::External).unwrap(), None);
        store.set_issued_index(KeyChain::External, 12).unwrap();
        assert_eq!(store.issued_index(KeyChain::External).unwrap(), Some(12));
        assert_eq!(store.issued_index(KeyChain::Internal).unwrap(), None);
    }
}
