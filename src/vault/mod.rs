// Conduit — Vault Module
//
// Turns stored ciphertext into short-lived plaintext. The decryption key is
// supplied by the caller on every execution and is never persisted; resolved
// values live in zeroizing buffers and are dropped when the call returns.

mod cipher;
mod error;
mod resolver;

pub use cipher::{open, seal, DecryptionKey, KEY_LEN, NONCE_LEN};
pub use error::VaultError;
pub use resolver::{CredentialResolver, DynamicHeaderKey, ResolvedCredential, ResolvedCredentials};
