// Conduit — Persisted record models
//
// SECURITY: credentials are persisted only in encrypted form. No type in this
// module ever carries a decrypted value; plaintext exists only inside
// `vault::ResolvedCredentials` for the lifetime of one execution.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::chain::ChainStep;
use crate::sandbox::RequestTemplate;

// ─── Credentials ─────────────────────────────────────────────────────────────

/// Where a credential is placed on the outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialType {
    Header,
    Cookie,
    Query,
    Body,
}

impl CredentialType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialType::Header => "header",
            CredentialType::Cookie => "cookie",
            CredentialType::Query => "query",
            CredentialType::Body => "body",
        }
    }
}

impl FromStr for CredentialType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "header" => Ok(CredentialType::Header),
            "cookie" => Ok(CredentialType::Cookie),
            "query" => Ok(CredentialType::Query),
            "body" => Ok(CredentialType::Body),
            other => Err(format!("unknown credential type '{}'", other)),
        }
    }
}

impl fmt::Display for CredentialType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A client-encrypted secret: base64 AES-256-GCM ciphertext and base64 nonce.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedValue {
    pub ciphertext: String,
    pub iv: String,
}

impl fmt::Debug for EncryptedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedValue")
            .field("ciphertext", &format_args!("<{} bytes b64>", self.ciphertext.len()))
            .field("iv", &self.iv)
            .finish()
    }
}

/// A stored credential record, owned by exactly one user.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: Uuid,
    pub owner_id: String,
    pub domain: String,
    pub credential_type: CredentialType,
    pub key: String,
    pub encrypted_value: EncryptedValue,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}::{} ({})",
            self.id, self.domain, self.key, self.credential_type
        )
    }
}

/// Listing view of a credential. Carries no ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSummary {
    pub id: Uuid,
    pub owner_id: String,
    pub domain: String,
    #[serde(rename = "type")]
    pub credential_type: CredentialType,
    pub key: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for the store-credentials operation. Values arrive pre-encrypted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCredential {
    pub domain: String,
    #[serde(rename = "type")]
    pub credential_type: CredentialType,
    pub key: String,
    pub encrypted_value: EncryptedValue,
    #[serde(default)]
    pub metadata: Value,
}

// ─── Abilities ───────────────────────────────────────────────────────────────

/// Reliability counters of an ability. Mutated only by the health tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthState {
    pub health_score: f64,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub is_defunct: bool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            health_score: 100.0,
            total_executions: 0,
            successful_executions: 0,
            is_defunct: false,
        }
    }
}

/// What an ability does when invoked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AbilityKind {
    /// A single declarative HTTP call.
    Http { template: RequestTemplate },
    /// Replay of an ordered list of chain steps.
    Workflow { steps: Vec<ChainStep> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ability {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub kind: AbilityKind,
    pub dynamic_headers_required: bool,
    /// `domain::headerName` entries naming every credential this ability needs.
    #[serde(default)]
    pub dynamic_header_keys: Vec<String>,
    #[serde(flatten)]
    pub health: HealthState,
    #[serde(default)]
    pub last_execution_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Ability {
    pub fn is_workflow(&self) -> bool {
        matches!(self.kind, AbilityKind::Workflow { .. })
    }
}

/// Input for registering an ability. Health fields always start at defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAbility {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub template: RequestTemplate,
    #[serde(default)]
    pub dynamic_header_keys: Vec<String>,
}

/// Point-in-time copy of an ability's health, appended every tenth execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub ability_id: String,
    pub health_score: f64,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub taken_at: DateTime<Utc>,
}

// ─── Tests ───────────────────────────────────────────────────────────────────
