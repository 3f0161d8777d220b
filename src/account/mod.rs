//! HD account engine
//!
//! - `keys.rs` - non-hardened derivation, scoped private key material
//! - `balance.rs` - unconfirmed balance resolution with conflict detection
//! - `transaction.rs` - legacy tx construction and signature plumbing
//! - `mod.rs` - the [`Account`] orchestrator: gap-limited address supply,
//!   issued-index tracking, balance cache and spend signing

pub mod balance;
pub mod keys;
pub mod transaction;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bitcoin::consensus::encode::serialize as consensus_serialize;
use bitcoin::hashes::{hash160, Hash};
use bitcoin::secp256k1::{All, Message, Secp256k1};
use bitcoin::{Address, Network, Transaction};

use crate::config::AccountConfig;
use crate::error::AccountError;
use crate::notify::{NotificationSink, TxKind};
use crate::storage::{sort_records, DerivedAddress, WalletStore};
use keys::{KeyChain, KeyProvider};

pub use balance::{resolve_unconfirmed, Resolution};

/// Sink the account contributes its bloom filter elements into. Sizing
/// and wire encoding of the filter belong to the network layer.
pub trait BloomSink {
    fn insert(&mut self, element: &[u8]);
}

/// A watch-only (optionally signing-capable) HD account over one external
/// and one internal chain.
///
/// All index/counter mutation runs under a per-account mutex so that
/// concurrent transaction notifications can never double-derive or skip
/// look-ahead indices.
pub struct Account {
    tag: String,
    xpub: bitcoin::bip32::Xpub,
    config: AccountConfig,
    store: Arc<dyn WalletStore>,
    notifier: Arc<dyn NotificationSink>,
    key_provider: Option<Arc<dyn KeyProvider>>,
    secp: Secp256k1<All>,
    // Serializes gap-window mutation; also guards the balance cache.
    state: Mutex<i64>,
}

impl Account {
    /// Open an account. Replenishes the look-ahead window immediately, so
    /// a fresh store ends up with `look_ahead` addresses per chain.
    pub fn new(
        tag: impl Into<String>,
        xpub: bitcoin::bip32::Xpub,
        config: AccountConfig,
        store: Arc<dyn WalletStore>,
        notifier: Arc<dyn NotificationSink>,
        key_provider: Option<Arc<dyn KeyProvider>>,
    ) -> Result<Self, AccountError> {
        let account = Self {
            tag: tag.into(),
            xpub,
            config,
            store,
            notifier,
            key_provider,
            secp: Secp256k1::new(),
            state: Mutex::new(0),
        };
        account.supply_enough_keys(false)?;
        let mut balance = account.lock_state();
        *balance = account.compute_balance()?;
        drop(balance);
        Ok(account)
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn network(&self) -> Network {
        self.config.network
    }

    pub fn xpub(&self) -> &bitcoin::bip32::Xpub {
        &self.xpub
    }

    pub fn is_watch_only(&self) -> bool {
        self.key_provider.is_none()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, i64> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------
    // Gap management
    // ------------------------------------------------------------------

    /// Restore the look-ahead invariant on both chains: keep
    /// `issued + 1 + look_ahead` addresses generated, deriving and
    /// persisting exactly the deficit.
    pub fn supply_enough_keys(&self, sync_complete: bool) -> Result<(), AccountError> {
        let _guard = self.lock_state();
        self.supply_enough_keys_locked(sync_complete)
    }

    fn supply_enough_keys_locked(&self, sync_complete: bool) -> Result<(), AccountError> {
        for chain in KeyChain::ALL {
            let issued = self.store.issued_index(chain)?;
            let target = issued.map_or(0, |i| i + 1) + self.config.look_ahead;
            let generated = self.store.generated_count(chain)?;
            if target <= generated {
                continue;
            }

            let root = keys::chain_root(&self.secp, &self.xpub, chain)?;
            let mut batch = Vec::with_capacity((target - generated) as usize);
            for index in generated..target {
                batch.push(DerivedAddress {
                    pub_key: keys::address_pubkey(&self.secp, &root, index)?,
                    chain,
                    index,
                    sync_complete,
                });
            }
            self.store.add_addresses(&batch)?;
            log::info!("supplied {} {} addresses", batch.len(), chain);
        }
        Ok(())
    }

    /// React to a newly observed transaction: advance issued indices to
    /// the highest touched index per chain (never backwards), replenish
    /// the look-ahead window, recompute balance and notify the delta.
    /// No-op when `related` is empty.
    pub fn on_new_tx(
        &self,
        tx: &Transaction,
        related: &[DerivedAddress],
        kind: TxKind,
    ) -> Result<(), AccountError> {
        if related.is_empty() {
            return Ok(());
        }

        let mut guard = self.lock_state();

        let mut max_touched: HashMap<KeyChain, u32> = HashMap::new();
        for address in related {
            let entry = max_touched.entry(address.chain).or_insert(address.index);
            if address.index > *entry {
                *entry = address.index;
            }
        }

        for (chain, max_index) in &max_touched {
            let issued = self.store.issued_index(*chain)?;
            if issued.map_or(true, |i| *max_index > i) {
                log::debug!("advancing {} issued index to {}", chain, max_index);
                self.store.set_issued_index(*chain, *max_index)?;
            }
        }

        self.supply_enough_keys_locked(true)?;

        let new_balance = self.compute_balance()?;
        let delta = new_balance - *guard;
        *guard = new_balance;
        drop(guard);

        self.notifier.notify_tx(&self.tag, Some(tx), kind, delta);
        Ok(())
    }

    /// The `DerivedAddress`es this transaction touches: owned output
    /// addresses plus any of the given input addresses that belong to
    /// this account.
    pub fn related_addresses(
        &self,
        tx: &Transaction,
        in_addresses: &[String],
    ) -> Result<Vec<DerivedAddress>, AccountError> {
        let mut related = Vec::new();
        for out in &tx.output {
            if let Ok(address) = Address::from_script(&out.script_pubkey, self.config.network) {
                if let Some(entry) = self.store.find_address(&address.to_string())? {
                    related.push(entry);
                }
            }
        }
        for address in in_addresses {
            if let Some(entry) = self.store.find_address(address)? {
                related.push(entry);
            }
        }
        Ok(related)
    }

    pub fn is_tx_related(
        &self,
        tx: &Transaction,
        in_addresses: &[String],
    ) -> Result<bool, AccountError> {
        Ok(!self.related_addresses(tx, in_addresses)?.is_empty())
    }

    pub fn is_send_from_me(&self, in_addresses: &[String]) -> Result<bool, AccountError> {
        for address in in_addresses {
            if self.store.find_address(address)?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ------------------------------------------------------------------
    // Balance
    // ------------------------------------------------------------------

    /// The cached spendable balance in satoshi.
    pub fn balance(&self) -> u64 {
        (*self.lock_state()).max(0) as u64
    }

    /// Recompute and cache the balance from storage.
    pub fn update_balance(&self) -> Result<u64, AccountError> {
        let mut guard = self.lock_state();
        *guard = self.compute_balance()?;
        Ok((*guard).max(0) as u64)
    }

    /// Signed difference against the previously cached balance; the cache
    /// is reset to the fresh value. Drives user-facing notifications.
    pub fn delta_balance(&self) -> Result<i64, AccountError> {
        let mut guard = self.lock_state();
        let old = *guard;
        *guard = self.compute_balance()?;
        Ok(*guard - old)
    }

    fn compute_balance(&self) -> Result<i64, AccountError> {
        let confirmed = self.store.confirmed_balance()? as i64;

        let mut records = self.store.unconfirmed_records()?;
        sort_records(&mut records);

        // Resolve ownership up front, one lookup per distinct script, so
        // a failing store surfaces as an error instead of a wrong delta.
        let mut owned_scripts: HashMap<bitcoin::ScriptBuf, bool> = HashMap::new();
        for record in &records {
            for out in &record.tx.output {
                if owned_scripts.contains_key(&out.script_pubkey) {
                    continue;
                }
                let owned = match Address::from_script(&out.script_pubkey, self.config.network) {
                    Ok(address) => self.store.find_address(&address.to_string())?.is_some(),
                    Err(_) => false,
                };
                owned_scripts.insert(out.script_pubkey.clone(), owned);
            }
        }
        let owned =
            |script: &bitcoin::Script| owned_scripts.get(script).copied().unwrap_or(false);
        let resolution = resolve_unconfirmed(&records, &owned);
        if !resolution.invalid.is_empty() {
            log::debug!(
                "{} unconfirmed transactions invalidated as double spends",
                resolution.invalid.len()
            );
        }
        Ok(confirmed + resolution.delta)
    }

    // ------------------------------------------------------------------
    // Spending
    // ------------------------------------------------------------------

    /// The change address for the next spend: the first internal address
    /// past the issued index. Guaranteed generated by the look-ahead
    /// invariant.
    pub fn new_change_address(&self) -> Result<Address, AccountError> {
        let next = self
            .store
            .issued_index(KeyChain::Internal)?
            .map_or(0, |i| i + 1);
        let entry = self
            .store
            .address_at(KeyChain::Internal, next)?
            .ok_or_else(|| {
                AccountError::Consistency(format!(
                    "internal address {} missing despite look-ahead",
                    next
                ))
            })?;
        Ok(entry.address(self.config.network))
    }

    /// Build, sign and verify a spend to `recipients`. Fails for
    /// watch-only accounts and when any input cannot be resolved to a
    /// derived address of this account. All private key material is
    /// erased before returning, on success and on error alike.
    pub fn new_tx(
        &self,
        recipients: &[(Address, u64)],
        password: &str,
    ) -> Result<Transaction, AccountError> {
        let provider = self
            .key_provider
            .as_ref()
            .ok_or_else(|| {
                AccountError::KeyUnavailable("account is watch-only".to_string())
            })?
            .clone();

        let utxos = self.store.unspent_outputs()?;
        let change_address = self.new_change_address()?;
        let (mut tx, selected) = transaction::build_unsigned(
            &utxos,
            recipients,
            &change_address,
            self.config.fee_per_kb,
            self.config.dust_limit,
        )?;

        // Resolve the owning derived address and spent script for every
        // input. A miss is an internal consistency fault, not retried.
        let mut signing: Vec<(DerivedAddress, bitcoin::ScriptBuf)> =
            Vec::with_capacity(selected.len());
        for outpoint in &selected {
            let prev_tx = self.store.transaction(&outpoint.txid)?.ok_or_else(|| {
                AccountError::Consistency(format!("missing source tx {}", outpoint.txid))
            })?;
            let prev_out = prev_tx
                .output
                .get(outpoint.vout as usize)
                .ok_or_else(|| {
                    AccountError::Consistency(format!("missing output {}", outpoint))
                })?;
            let address = Address::from_script(&prev_out.script_pubkey, self.config.network)
                .map_err(|e| AccountError::Consistency(e.to_string()))?;
            let entry = self
                .store
                .find_address(&address.to_string())?
                .ok_or_else(|| {
                    AccountError::Consistency(format!("input address {} not ours", address))
                })?;
            signing.push((entry, prev_out.script_pubkey.clone()));
        }
        if signing.len() != tx.input.len() {
            return Err(AccountError::Consistency(format!(
                "{} signing addresses for {} inputs",
                signing.len(),
                tx.input.len()
            )));
        }

        // Scoped wrappers wipe the account key, both chain roots and every
        // cached leaf on drop, which covers each early return below.
        let account_key = provider.account_xpriv(password)?;
        let external_root =
            keys::chain_root_priv(&self.secp, account_key.as_xpriv(), KeyChain::External)?;
        let internal_root =
            keys::chain_root_priv(&self.secp, account_key.as_xpriv(), KeyChain::Internal)?;
        drop(account_key);

        let mut leaf_cache: HashMap<(KeyChain, u32), keys::ScopedKey> = HashMap::new();
        for (index, (entry, script)) in signing.iter().enumerate() {
            let cache_key = (entry.chain, entry.index);
            if !leaf_cache.contains_key(&cache_key) {
                let root = match entry.chain {
                    KeyChain::External => &external_root,
                    KeyChain::Internal => &internal_root,
                };
                leaf_cache.insert(cache_key, keys::address_key(&self.secp, root, entry.index)?);
            }
            let key = &leaf_cache[&cache_key];

            let sighash = transaction::legacy_sighash(&tx, index, script)?;
            let signature = self
                .secp
                .sign_ecdsa(&Message::from_digest(sighash), key.secret());
            tx.input[index].script_sig =
                transaction::p2pkh_script_sig(&signature, &key.public_key(&self.secp))?;
        }

        let spent_scripts: Vec<bitcoin::ScriptBuf> =
            signing.iter().map(|(_, script)| script.clone()).collect();
        transaction::verify_p2pkh_signatures(&self.secp, &tx, &spent_scripts)?;

        log::info!(
            "built and signed tx {} ({} inputs, {} outputs)",
            tx.compute_txid(),
            tx.input.len(),
            tx.output.len()
        );
        Ok(tx)
    }

    // ------------------------------------------------------------------
    // Bloom filter contribution
    // ------------------------------------------------------------------

    /// Number of elements [`Account::add_bloom_elements`] will insert,
    /// so the filter can be sized before filling.
    pub fn bloom_element_count(&self) -> Result<u32, AccountError> {
        let external = self.store.generated_count(KeyChain::External)?;
        let internal_unspent = self
            .store
            .unspent_outputs_for_chain(KeyChain::Internal)?
            .len() as u32;
        Ok(external * 2 + internal_unspent)
    }

    /// Contribute every external public key, its hash160, and each
    /// internal unspent outpoint encoding.
    pub fn add_bloom_elements(&self, sink: &mut dyn BloomSink) -> Result<(), AccountError> {
        for pub_key in self.store.external_pubkeys()? {
            let serialized = pub_key.serialize();
            sink.insert(&serialized);
            sink.insert(hash160::Hash::hash(&serialized).as_byte_array());
        }
        for utxo in self.store.unspent_outputs_for_chain(KeyChain::Internal)? {
            sink.insert(&consensus_serialize(&utxo.outpoint));
        }
        Ok(())
    }

    /// True once every generated address has been seen by a full sync.
    pub fn is_sync_complete(&self) -> Result<bool, AccountError> {
        // Cheap proxy over the generated window; storage tracks the flag
        // per address.
        for chain in KeyChain::ALL {
            let count = self.store.generated_count(chain)?;
            for index in 0..count {
                if let Some(entry) = self.store.address_at(chain, index)? {
                    if !entry.sync_complete {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    pub fn mark_sync_complete(&self, chain: KeyChain, index: u32) -> Result<(), AccountError> {
        self.store.set_sync_complete(chain, index)?;
        Ok(())
    }
}

pub use transaction::{build_unsigned, estimate_fee, is_signed};
