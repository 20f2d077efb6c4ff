// Conduit — Store Module
//
// Record storage for credentials and abilities. Credential values are
// persisted exactly as the client encrypted them; this module performs no
// cryptography. Credential mutations are audit-logged.

mod abilities;
mod credentials;
mod db;
mod error;
mod models;

pub use abilities::{AbilityStore, SqliteAbilityStore};
pub use credentials::{CredentialStore, SqliteCredentialStore};
pub use db::Database;
pub use error::StoreError;
pub use models::{
    Ability, AbilityKind, Credential, CredentialSummary, CredentialType, EncryptedValue,
    HealthSnapshot, HealthState, NewAbility, NewCredential,
};

/// Parse an RFC 3339 timestamp column, falling back to "now" on corrupt data.
pub(crate) fn parse_timestamp(raw: &str) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(|_| chrono::Utc::now())
}
