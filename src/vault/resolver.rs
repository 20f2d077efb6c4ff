// Conduit — Credential Resolver
//
// Given the dynamic header keys an ability declares, fetch the owner's
// credentials once, keep only the domains in question and decrypt exactly
// those records. Resolution is all-or-nothing: a declared key that is still
// missing after decryption fails the whole call.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use zeroize::Zeroizing;

use super::{open, DecryptionKey, VaultError};
use crate::store::{Credential, CredentialStore, CredentialType};

/// A parsed `domain::headerName` entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DynamicHeaderKey {
    pub domain: String,
    pub header: String,
}

impl FromStr for DynamicHeaderKey {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (domain, header) = s
            .split_once("::")
            .ok_or_else(|| VaultError::MalformedKey(s.to_string()))?;
        let (domain, header) = (domain.trim(), header.trim());
        if domain.is_empty() || header.is_empty() {
            return Err(VaultError::MalformedKey(s.to_string()));
        }
        Ok(Self {
            domain: domain.to_ascii_lowercase(),
            header: header.to_string(),
        })
    }
}

impl fmt::Display for DynamicHeaderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.domain, self.header)
    }
}

/// One decrypted credential, alive for a single execution.
pub struct ResolvedCredential {
    key: String,
    credential_type: CredentialType,
    value: Zeroizing<String>,
}

impl ResolvedCredential {
    pub(crate) fn new(key: &str, credential_type: CredentialType, value: Zeroizing<String>) -> Self {
        Self {
            key: key.to_string(),
            credential_type,
            value,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn credential_type(&self) -> CredentialType {
        self.credential_type
    }

    /// Plaintext value. Only the sandbox reads this.
    pub(crate) fn expose(&self) -> &str {
        &self.value
    }
}

/// The transient map of decrypted credentials for one execution.
#[derive(Default)]
pub struct ResolvedCredentials {
    entries: Vec<ResolvedCredential>,
}

impl ResolvedCredentials {
    pub(crate) fn new(entries: Vec<ResolvedCredential>) -> Self {
        Self { entries }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResolvedCredential> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for ResolvedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = self
            .entries
            .iter()
            .map(|e| format!("{} ({})", e.key, e.credential_type))
            .collect();
        f.debug_struct("ResolvedCredentials")
            .field("keys", &keys)
            .finish()
    }
}

pub struct CredentialResolver<'a> {
    store: &'a dyn CredentialStore,
}

impl<'a> CredentialResolver<'a> {
    pub fn new(store: &'a dyn CredentialStore) -> Self {
        Self { store }
    }

    /// Resolve every key in `required` for `owner_id`, or fail listing the
    /// keys that could not be resolved.
    pub fn resolve(
        &self,
        owner_id: &str,
        key: &DecryptionKey,
        required: &[String],
    ) -> Result<ResolvedCredentials, VaultError> {
        let required: BTreeSet<DynamicHeaderKey> = required
            .iter()
            .map(|k| k.parse())
            .collect::<Result<_, _>>()?;
        if required.is_empty() {
            return Ok(ResolvedCredentials::default());
        }

        let required_domains: BTreeSet<&str> =
            required.iter().map(|k| k.domain.as_str()).collect();

        let relevant: Vec<Credential> = self
            .store
            .list_for_owner(owner_id)?
            .into_iter()
            .filter(|c| required_domains.contains(c.domain.to_ascii_lowercase().as_str()))
            .collect();

        tracing::debug!(
            owner_id = %owner_id,
            required = required.len(),
            relevant = relevant.len(),
            "Resolving credentials"
        );

        let mut entries = Vec::new();
        let mut found: BTreeSet<&DynamicHeaderKey> = BTreeSet::new();

        for credential in &relevant {
            let wanted = required.iter().find(|k| {
                k.domain.eq_ignore_ascii_case(&credential.domain)
                    && k.header.eq_ignore_ascii_case(&credential.key)
            });
            let Some(wanted) = wanted else {
                continue;
            };

            let value = match open(key, &credential.encrypted_value) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(
                        credential_id = %credential.id,
                        domain = %credential.domain,
                        error = %e,
                        "Skipping credential that failed to decrypt"
                    );
                    continue;
                }
            };

            self.store
                .log_access(&credential.id, "resolved", owner_id, None)?;
            entries.push(ResolvedCredential::new(
                &credential.key,
                credential.credential_type,
                value,
            ));
            found.insert(wanted);
        }

        let missing: Vec<String> = required
            .iter()
            .filter(|k| !found.contains(k))
            .map(|k| k.to_string())
            .collect();
        if !missing.is_empty() {
            tracing::info!(
                owner_id = %owner_id,
                missing = missing.len(),
                "Credential resolution incomplete"
            );
            return Err(VaultError::MissingCredentials(missing));
        }

        Ok(ResolvedCredentials::new(entries))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
