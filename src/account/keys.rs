//! HD key derivation for the account
//!
//! Only non-hardened derivation is used below the account level, so the
//! full address space is reachable from the account xpub alone (watch-only
//! operation). Private-side derivations yield scoped wrappers that erase
//! the key material when dropped; callers must keep their lifetime as
//! short as possible.

use bip39::Mnemonic;
use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv, Xpub};
use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use bitcoin::Network;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::AccountError;

/// The two logical chains of an account, BIP44 change levels 0 and 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyChain {
    /// Receiving addresses handed out to counterparties
    External,
    /// Change addresses, never shown to the user
    Internal,
}

impl KeyChain {
    pub const ALL: [KeyChain; 2] = [KeyChain::External, KeyChain::Internal];

    fn child_number(self) -> ChildNumber {
        match self {
            KeyChain::External => ChildNumber::Normal { index: 0 },
            KeyChain::Internal => ChildNumber::Normal { index: 1 },
        }
    }
}

impl std::fmt::Display for KeyChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyChain::External => write!(f, "external"),
            KeyChain::Internal => write!(f, "internal"),
        }
    }
}

/// Derive the chain-level root key (account/0 or account/1) from the
/// account xpub. One non-hardened step, deterministic.
pub fn chain_root(
    secp: &Secp256k1<All>,
    account: &Xpub,
    chain: KeyChain,
) -> Result<Xpub, AccountError> {
    account
        .derive_pub(secp, &[chain.child_number()])
        .map_err(|e| AccountError::Bitcoin(e.to_string()))
}

/// Derive the public key at `index` below a chain root. One further
/// non-hardened step.
pub fn address_pubkey(
    secp: &Secp256k1<All>,
    chain_root: &Xpub,
    index: u32,
) -> Result<PublicKey, AccountError> {
    let child =
        ChildNumber::from_normal_idx(index).map_err(|e| AccountError::Bitcoin(e.to_string()))?;
    let derived = chain_root
        .derive_pub(secp, &[child])
        .map_err(|e| AccountError::Bitcoin(e.to_string()))?;
    Ok(derived.public_key)
}

/// An extended private key that erases its secret on drop.
pub struct ScopedXpriv(Xpriv);

impl ScopedXpriv {
    pub fn new(key: Xpriv) -> Self {
        Self(key)
    }

    pub fn as_xpriv(&self) -> &Xpriv {
        &self.0
    }

    /// The corresponding extended public key.
    pub fn to_xpub(&self, secp: &Secp256k1<All>) -> Xpub {
        Xpub::from_priv(secp, &self.0)
    }
}

impl Drop for ScopedXpriv {
    fn drop(&mut self) {
        self.0.private_key.non_secure_erase();
    }
}

/// A leaf private key that erases its secret on drop.
pub struct ScopedKey(SecretKey);

impl ScopedKey {
    pub fn secret(&self) -> &SecretKey {
        &self.0
    }

    pub fn public_key(&self, secp: &Secp256k1<All>) -> PublicKey {
        self.0.public_key(secp)
    }
}

impl Drop for ScopedKey {
    fn drop(&mut self) {
        self.0.non_secure_erase();
    }
}

/// Private-side counterpart of [`chain_root`].
pub fn chain_root_priv(
    secp: &Secp256k1<All>,
    account: &Xpriv,
    chain: KeyChain,
) -> Result<ScopedXpriv, AccountError> {
    account
        .derive_priv(secp, &[chain.child_number()])
        .map(ScopedXpriv)
        .map_err(|e| AccountError::Bitcoin(e.to_string()))
}

/// Private-side counterpart of [`address_pubkey`].
pub fn address_key(
    secp: &Secp256k1<All>,
    chain_root: &ScopedXpriv,
    index: u32,
) -> Result<ScopedKey, AccountError> {
    let child =
        ChildNumber::from_normal_idx(index).map_err(|e| AccountError::Bitcoin(e.to_string()))?;
    let derived = chain_root
        .as_xpriv()
        .derive_priv(secp, &[child])
        .map_err(|e| AccountError::Bitcoin(e.to_string()))?;
    let key = ScopedKey(derived.private_key);
    // The intermediate Xpriv is a stack copy; erase it as well.
    let mut tmp = derived;
    tmp.private_key.non_secure_erase();
    Ok(key)
}

/// Capability that produces the account-level extended private key on
/// demand. Watch-only accounts have no provider.
pub trait KeyProvider: Send + Sync {
    fn account_xpriv(&self, password: &str) -> Result<ScopedXpriv, AccountError>;
}

/// [`KeyProvider`] backed by a BIP39 mnemonic. The password is used as the
/// BIP39 passphrase; the derived account xpub is cross-checked against the
/// one recorded at account creation, so a wrong passphrase fails instead
/// of silently deriving foreign keys.
pub struct MnemonicKeyProvider {
    mnemonic: Mnemonic,
    network: Network,
    account_path: DerivationPath,
    expected: Xpub,
}

impl MnemonicKeyProvider {
    pub fn new(
        mnemonic: Mnemonic,
        network: Network,
        account_path: DerivationPath,
        expected: Xpub,
    ) -> Self {
        Self {
            mnemonic,
            network,
            account_path,
            expected,
        }
    }

    /// The account xpub a mnemonic/passphrase pair produces, used once at
    /// account creation to seed [`MnemonicKeyProvider::new`].
    pub fn account_xpub(
        mnemonic: &Mnemonic,
        password: &str,
        network: Network,
        account_path: &DerivationPath,
    ) -> Result<Xpub, AccountError> {
        let secp = Secp256k1::new();
        let account = derive_account_xpriv(&secp, mnemonic, password, network, account_path)?;
        Ok(account.to_xpub(&secp))
    }
}

impl KeyProvider for MnemonicKeyProvider {
    fn account_xpriv(&self, password: &str) -> Result<ScopedXpriv, AccountError> {
        let secp = Secp256k1::new();
        let account =
            derive_account_xpriv(&secp, &self.mnemonic, password, self.network, &self.account_path)?;
        if account.to_xpub(&secp) != self.expected {
            return Err(AccountError::KeyUnavailable(
                "passphrase does not match the account key".to_string(),
            ));
        }
        Ok(account)
    }
}

fn derive_account_xpriv(
    secp: &Secp256k1<All>,
    mnemonic: &Mnemonic,
    password: &str,
    network: Network,
    account_path: &DerivationPath,
) -> Result<ScopedXpriv, AccountError> {
    let mut seed = mnemonic.to_seed(password);
    let master = Xpriv::new_master(network, &seed);
    seed.zeroize();
    let master = ScopedXpriv(master.map_err(|e| AccountError::Bitcoin(e.to_string()))?);
    master
        .as_xpriv()
        .derive_priv(secp, account_path)
        .map(ScopedXpriv)
        .map_err(|e| AccountError::Bitcoin(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn test_mnemonic() -> Mnemonic {
        Mnemonic::parse(
            "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about",
        )
        .unwrap()
    }

    fn test_path() -> DerivationPath {
        DerivationPath::from_str("m/44'/0'/0'").unwrap()
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let secp = Secp256k1::new();
        let xpub = MnemonicKeyProvider::account_xpub(
            &test_mnemonic(),
            "",
            Network::Bitcoin,
            &test_path(),
        )
        .unwrap();

        let root_a = chain_root(&secp, &xpub, KeyChain::External).unwrap();
        let root_b = chain_root(&secp, &xpub, KeyChain::External).unwrap();
        assert_eq!(root_a, root_b);

        let pk_a = address_pubkey(&secp, &root_a, 7).unwrap();
        let pk_b = address_pubkey(&secp, &root_b, 7).unwrap();
        assert_eq!(pk_a, pk_b);
    }

    #[test]
    fn test_chains_do_not_collide() {
        let secp = Secp256k1::new();
        let xpub = MnemonicKeyProvider::account_xpub(
            &test_mnemonic(),
            "",
            Network::Bitcoin,
            &test_path(),
        )
        .unwrap();

        let external = chain_root(&secp, &xpub, KeyChain::External).unwrap();
        let internal = chain_root(&secp, &xpub, KeyChain::Internal).unwrap();
        assert_ne!(
            address_pubkey(&secp, &external, 0).unwrap(),
            address_pubkey(&secp, &internal, 0).unwrap()
        );
    }

    #[test]
    fn test_private_and_public_derivation_agree() {
        let secp = Secp256k1::new();
        let mnemonic = test_mnemonic();
        let xpub =
            MnemonicKeyProvider::account_xpub(&mnemonic, "", Network::Bitcoin, &test_path())
                .unwrap();
        let provider =
            MnemonicKeyProvider::new(mnemonic, Network::Bitcoin, test_path(), xpub);

        let account = provider.account_xpriv("").unwrap();
        let priv_root = chain_root_priv(&secp, account.as_xpriv(), KeyChain::Internal).unwrap();
        let pub_root = chain_root(&secp, &xpub, KeyChain::Internal).unwrap();

        let leaf = address_key(&secp, &priv_root, 42).unwrap();
        assert_eq!(
            leaf.public_key(&secp),
            address_pubkey(&secp, &pub_root, 42).unwrap()
        );
    }

    #[test]
    fn test_wrong_passphrase_is_rejected() {
        let mnemonic = test_mnemonic();
        let xpub =
            MnemonicKeyProvider::account_xpub(&mnemonic, "", Network::Bitcoin, &test_path())
                .unwrap();
        let provider =
            MnemonicKeyProvider::new(mnemonic, Network::Bitcoin, test_path(), xpub);

        assert!(provider.account_xpriv("").is_ok());
        assert!(matches!(
            provider.account_xpriv("wrong"),
            Err(AccountError::KeyUnavailable(_))
        ));
    }
}
