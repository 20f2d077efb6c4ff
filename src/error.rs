// Conduit — Top-level error types
//
// Aggregates errors from the store, vault, sandbox, chain and engine modules
// into a single error enum for the application boundary.

use thiserror::Error;

/// Top-level error type for all Conduit operations.
#[derive(Debug, Error)]
pub enum ConduitError {
    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("Vault error: {0}")]
    Vault(#[from] crate::vault::VaultError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] crate::sandbox::SandboxError),

    #[error("Chain error: {0}")]
    Chain(#[from] crate::chain::ChainError),

    #[error(transparent)]
    Engine(#[from] crate::engine::EngineError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, ConduitError>;
