// Conduit — Sandbox error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Template error: {0}")]
    Template(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Credential injection failed: {0}")]
    Injection(String),

    #[error("Upstream request failed: {0}")]
    Transport(String),
}
