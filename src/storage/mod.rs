//! Storage and persistence layer
//!
//! The account engine never owns addresses, transactions or indices; it
//! talks to a [`WalletStore`] collaborator. Two reference implementations
//! are provided: an in-memory store and a JSON file-per-wallet store.

mod file_system;
mod memory;
mod models;

pub use file_system::FileStore;
pub use memory::MemoryStore;
pub use models::{sort_records, ChainState, DerivedAddress, Metadata, TxRecord, Utxo};

use bitcoin::secp256k1::PublicKey;
use bitcoin::{Transaction, Txid};

use crate::account::keys::KeyChain;
use crate::error::StorageError;

/// Persistence contract consumed by the account engine. Implementations
/// use interior mutability; every method takes `&self` and must expose
/// each record all-or-nothing to concurrent readers.
pub trait WalletStore: Send + Sync {
    /// Persist a batch of freshly derived addresses.
    fn add_addresses(&self, batch: &[DerivedAddress]) -> Result<(), StorageError>;

    /// Number of addresses materialized so far on a chain.
    fn generated_count(&self, chain: KeyChain) -> Result<u32, StorageError>;

    /// Highest index referenced by any observed transaction on a chain.
    fn issued_index(&self, chain: KeyChain) -> Result<Option<u32>, StorageError>;

    fn set_issued_index(&self, chain: KeyChain, index: u32) -> Result<(), StorageError>;

    /// Address entry at `(chain, index)`, if generated.
    fn address_at(&self, chain: KeyChain, index: u32)
        -> Result<Option<DerivedAddress>, StorageError>;

    /// Map an address string back to its owning entry.
    fn find_address(&self, address: &str) -> Result<Option<DerivedAddress>, StorageError>;

    fn set_sync_complete(&self, chain: KeyChain, index: u32) -> Result<(), StorageError>;

    /// All generated external-chain public keys, for bloom contribution.
    fn external_pubkeys(&self) -> Result<Vec<PublicKey>, StorageError>;

    /// Unspent outputs owned by the account.
    fn unspent_outputs(&self) -> Result<Vec<Utxo>, StorageError>;

    fn unspent_outputs_for_chain(&self, chain: KeyChain) -> Result<Vec<Utxo>, StorageError>;

    /// All currently unconfirmed transaction records.
    fn unconfirmed_records(&self) -> Result<Vec<TxRecord>, StorageError>;

    /// Fetch a stored transaction by hash, confirmed or not.
    fn transaction(&self, txid: &Txid) -> Result<Option<Transaction>, StorageError>;

    /// Confirmed balance as tracked by the store.
    fn confirmed_balance(&self) -> Result<u64, StorageError>;
}
