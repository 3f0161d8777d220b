//! Data models for account storage

use bitcoin::secp256k1::PublicKey;
use bitcoin::{Address, Network, OutPoint, Transaction, Txid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::account::keys::KeyChain;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub network: String,
}

/// One derived address of a chain. Immutable once created except for
/// `sync_complete`; identified by `(chain, index)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivedAddress {
    pub pub_key: PublicKey,
    pub chain: KeyChain,
    pub index: u32,
    pub sync_complete: bool,
}

impl DerivedAddress {
    /// The P2PKH address form of this entry's public key.
    pub fn address(&self, network: Network) -> Address {
        Address::p2pkh(bitcoin::PublicKey::new(self.pub_key).pubkey_hash(), network)
    }
}

/// Per-chain counters. `issued` is the highest index referenced by any
/// observed transaction (`None` if no address was ever used).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ChainState {
    pub issued: Option<u32>,
}

/// A stored transaction together with its confirmation status and the
/// arrival timestamp that defines the natural processing order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxRecord {
    pub tx: Transaction,
    /// Block height, `None` while unconfirmed
    pub height: Option<u32>,
    pub seen_at: DateTime<Utc>,
}

impl TxRecord {
    pub fn txid(&self) -> Txid {
        self.tx.compute_txid()
    }

    pub fn is_unconfirmed(&self) -> bool {
        self.height.is_none()
    }
}

/// Sort records into their natural order: arrival time, tie-broken by txid.
pub fn sort_records(records: &mut [TxRecord]) {
    records.sort_by_key(|r| (r.seen_at, r.txid()));
}

/// An unspent output owned by the account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub value: u64,
    pub address: String,
    pub chain: KeyChain,
    pub index: u32,
    pub confirmed: bool,
}
