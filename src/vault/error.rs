// Conduit — Vault error types

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Invalid decryption key: {0}")]
    InvalidKey(String),

    #[error("Encryption error: {0}")]
    Encrypt(String),

    #[error("Decryption failed: {0}")]
    Decrypt(String),

    #[error("Malformed dynamic header key '{0}' (expected domain::headerName)")]
    MalformedKey(String),

    #[error("Missing required credentials after decryption: {}", .0.join(", "))]
    MissingCredentials(Vec<String>),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
