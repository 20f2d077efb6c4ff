// Conduit — Chain error types

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("A chain needs between 1 and {max} steps, got {got}")]
    InvalidLength { got: usize, max: usize },

    #[error("Ability not found: {0}")]
    AbilityNotFound(String),

    #[error("Workflow ability '{0}' cannot be used as a chain step")]
    NestedWorkflow(String),

    #[error("Output transform failed: {0}")]
    Transform(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
