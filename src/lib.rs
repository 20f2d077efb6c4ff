// Conduit — Library root
//
// Credential-scoped execution of recorded HTTP abilities: encrypted
// credential storage, per-call resolution, sandboxed execution, health
// tracking and chaining.

pub mod chain;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod health;
pub mod sandbox;
pub mod store;
pub mod vault;

pub use engine::{EngineError, ExecutionEngine};
pub use error::{ConduitError, Result};
