use thiserror::Error;

#[derive(Error, Debug)]
pub enum AccountError {
    #[error("Invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    #[error("Key material unavailable: {0}")]
    KeyUnavailable(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Bitcoin error: {0}")]
    Bitcoin(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Account inconsistency: {0}")]
    Consistency(String),

    #[error("Signature verification failed: {0}")]
    Verification(String),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Wallet already exists: {0}")]
    WalletExists(String),

    #[error("Wallet directory not found: {0}")]
    DirectoryNotFound(String),

    #[error("File not found: {0}")]
    FileNotFound(String),
}
