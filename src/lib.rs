//! HD account engine for an SPV Bitcoin wallet
//!
//! Modular account implementation with clear separation of concerns:
//!
//! - `account/` - HD account orchestrator, key derivation, balance
//!   resolution and transaction building
//! - `multisig/` - threshold signature pool for P2SH multisig spends
//! - `storage/` - persistence contract plus in-memory and JSON file
//!   reference stores
//! - `config.rs` - network selection, look-ahead and fee parameters
//! - `notify.rs` - outbound transaction notification seam
//! - `error.rs` - error taxonomy

pub mod account;
pub mod config;
pub mod error;
pub mod multisig;
pub mod notify;
pub mod storage;

// Main entry points
pub use account::Account;
pub use config::AccountConfig;
pub use error::{AccountError, StorageError};
pub use multisig::SignaturePool;
pub use storage::WalletStore;
