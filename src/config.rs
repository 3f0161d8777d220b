//! Account configuration from environment variables
//!
//! Controls the Bitcoin network, the look-ahead window and fee policy used
//! when building transactions. Defaults to mainnet with the standard 100
//! address look-ahead.

use bitcoin::bip32::DerivationPath;
use bitcoin::Network;
use std::env;
use std::str::FromStr;

/// Addresses kept pre-generated past the highest used index on each chain.
pub const LOOK_AHEAD_SIZE: u32 = 100;

/// Default fee in satoshi per 1000 bytes of transaction size.
pub const DEFAULT_FEE_PER_KB: u64 = 10_000;

/// Outputs below this value are folded into the fee instead of creating
/// uneconomical change.
pub const DUST_LIMIT: u64 = 546;

#[derive(Clone, Debug)]
pub struct AccountConfig {
    /// Bitcoin network type
    pub network: Network,
    /// Look-ahead window size per chain
    pub look_ahead: u32,
    /// Fee rate in satoshi per kilobyte
    pub fee_per_kb: u64,
    /// Minimum change output value in satoshi
    pub dust_limit: u64,
}

impl AccountConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `BITCOIN_NETWORK`: "bitcoin" (default), "testnet", "signet" or "regtest"
    /// - `LOOK_AHEAD_SIZE`: look-ahead window per chain (default 100)
    /// - `FEE_PER_KB`: fee rate in sat/kB (default 10000)
    pub fn from_env() -> Self {
        let network_str = env::var("BITCOIN_NETWORK")
            .unwrap_or_else(|_| "bitcoin".to_string())
            .to_lowercase();

        let network = match network_str.as_str() {
            "bitcoin" | "mainnet" | "" => Network::Bitcoin,
            "testnet" => Network::Testnet,
            "signet" => Network::Signet,
            "regtest" => Network::Regtest,
            other => {
                log::warn!("Unknown network '{}', defaulting to mainnet", other);
                Network::Bitcoin
            }
        };

        let look_ahead = env::var("LOOK_AHEAD_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(LOOK_AHEAD_SIZE);

        let fee_per_kb = env::var("FEE_PER_KB")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_FEE_PER_KB);

        Self {
            network,
            look_ahead,
            fee_per_kb,
            dust_limit: DUST_LIMIT,
        }
    }

    /// Get the BIP44 coin type for this network
    ///
    /// - Mainnet: 0
    /// - Testnet/Signet/Regtest: 1
    pub fn coin_type(&self) -> u32 {
        match self.network {
            Network::Bitcoin => 0,
            _ => 1,
        }
    }

    /// BIP44 account-level derivation path: m/44'/coin_type'/0'
    pub fn account_path(&self) -> DerivationPath {
        // Both components are well-formed constants, parsing cannot fail.
        DerivationPath::from_str(&format!("m/44'/{}'/0'", self.coin_type()))
            .unwrap_or_else(|_| DerivationPath::master())
    }
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            look_ahead: LOOK_AHEAD_SIZE,
            fee_per_kb: DEFAULT_FEE_PER_KB,
            dust_limit: DUST_LIMIT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_mainnet() {
        let config = AccountConfig::default();
        assert!(matches!(config.network, Network::Bitcoin));
        assert_eq!(config.look_ahead, 100);
    }

    #[test]
    fn test_coin_type() {
        let mainnet = AccountConfig::default();
        assert_eq!(mainnet.coin_type(), 0);
        assert_eq!(mainnet.account_path().to_string(), "44'/0'/0'");

        let testnet = AccountConfig {
            network: Network::Testnet,
            ..Default::default()
        };
        assert_eq!(testnet.coin_type(), 1);
    }
}
