// Conduit — Credential Store Repository
//
// Persists (owner, domain, type, key) -> encrypted value records.
// Key design decision: the store never sees plaintext. Writes accept only
// client-encrypted values, and reads hand the ciphertext to the resolver,
// which decrypts in memory with a key supplied per execution.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use uuid::Uuid;

use super::db::Database;
use super::models::{Credential, CredentialSummary, CredentialType, EncryptedValue, NewCredential};
use super::{parse_timestamp, StoreError};

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over credential storage operations.
pub trait CredentialStore: Send + Sync {
    /// Insert or fully replace the record keyed by `(owner, domain, type, key)`.
    /// Returns the record id; a replaced record keeps its original id.
    fn upsert(&self, owner_id: &str, credential: NewCredential) -> Result<Uuid, StoreError>;

    /// Every credential owned by `owner_id`, still encrypted.
    fn list_for_owner(&self, owner_id: &str) -> Result<Vec<Credential>, StoreError>;

    /// Metadata for every credential owned by `owner_id` (no ciphertext).
    fn list_summaries(&self, owner_id: &str) -> Result<Vec<CredentialSummary>, StoreError>;

    /// Delete one of the owner's credentials. Returns true if it existed.
    fn delete(&self, owner_id: &str, id: &Uuid) -> Result<bool, StoreError>;

    /// Retrieve the audit log for one of the owner's credentials.
    fn get_audit_logs(&self, owner_id: &str, id: &Uuid) -> Result<Vec<String>, StoreError>;

    /// Write an entry to the audit log.
    fn log_access(
        &self,
        credential_id: &Uuid,
        action: &str,
        actor: &str,
        details: Option<&str>,
    ) -> Result<(), StoreError>;
}

// ─── SQLite Implementation ──────────────────────────────────────────────────

pub struct SqliteCredentialStore<'a> {
    db: &'a Database,
}

impl<'a> SqliteCredentialStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Parse a full credential row.
    fn row_to_credential(row: &rusqlite::Row<'_>) -> rusqlite::Result<Credential> {
        let id_str: String = row.get(0)?;
        let type_str: String = row.get(3)?;
        let metadata_json: String = row.get(7)?;
        let created_at_str: String = row.get(8)?;
        let updated_at_str: String = row.get(9)?;

        let id = Uuid::parse_str(&id_str).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?;
        let credential_type = parse_type(&type_str)?;

        Ok(Credential {
            id,
            owner_id: row.get(1)?,
            domain: row.get(2)?,
            credential_type,
            key: row.get(4)?,
            encrypted_value: EncryptedValue {
                ciphertext: row.get(5)?,
                iv: row.get(6)?,
            },
            metadata: serde_json::from_str(&metadata_json).unwrap_or(Value::Null),
            created_at: parse_timestamp(&created_at_str),
            updated_at: parse_timestamp(&updated_at_str),
        })
    }

    fn owns(conn: &Connection, owner_id: &str, id: &Uuid) -> Result<bool, StoreError> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM credentials WHERE id = ?1 AND owner_id = ?2",
                params![id.to_string(), owner_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

fn parse_type(raw: &str) -> rusqlite::Result<CredentialType> {
    raw.parse::<CredentialType>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            Box::new(StoreError::Other(e)),
        )
    })
}

fn insert_audit(
    conn: &Connection,
    credential_id: &Uuid,
    action: &str,
    actor: &str,
    details: Option<&str>,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO audit_log (credential_id, action, actor, timestamp, details)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            credential_id.to_string(),
            action,
            actor,
            Utc::now().to_rfc3339(),
            details,
        ],
    )?;

    tracing::debug!(
        credential_id = %credential_id,
        action = %action,
        actor = %actor,
        "Audit log entry recorded"
    );
    Ok(())
}

const SELECT_COLUMNS: &str = "SELECT id, owner_id, domain, credential_type, key,
        ciphertext, iv, metadata, created_at, updated_at
     FROM credentials";

impl<'a> CredentialStore for SqliteCredentialStore<'a> {
    fn upsert(&self, owner_id: &str, cred: NewCredential) -> Result<Uuid, StoreError> {
        let now = Utc::now().to_rfc3339();
        let metadata_json = serde_json::to_string(&cred.metadata)?;

        let conn = self.db.conn()?;
        let tx = conn.unchecked_transaction()?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM credentials
                 WHERE owner_id = ?1 AND domain = ?2 AND credential_type = ?3 AND key = ?4",
                params![owner_id, cred.domain, cred.credential_type.as_str(), cred.key],
                |row| row.get(0),
            )
            .optional()?;

        let (id, action) = match existing {
            Some(id_str) => {
                let id = Uuid::parse_str(&id_str)
                    .map_err(|e| StoreError::Other(format!("corrupt credential id: {}", e)))?;
                tx.execute(
                    "UPDATE credentials
                     SET ciphertext = ?2, iv = ?3, metadata = ?4, updated_at = ?5
                     WHERE id = ?1",
                    params![
                        id_str,
                        cred.encrypted_value.ciphertext,
                        cred.encrypted_value.iv,
                        metadata_json,
                        now,
                    ],
                )?;
                (id, "replaced")
            }
            None => {
                let id = Uuid::new_v4();
                tx.execute(
                    "INSERT INTO credentials
                        (id, owner_id, domain, credential_type, key,
                         ciphertext, iv, metadata, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        id.to_string(),
                        owner_id,
                        cred.domain,
                        cred.credential_type.as_str(),
                        cred.key,
                        cred.encrypted_value.ciphertext,
                        cred.encrypted_value.iv,
                        metadata_json,
                        now,
                        now,
                    ],
                )?;
                (id, "created")
            }
        };

        insert_audit(&tx, &id, action, owner_id, None)?;
        tx.commit()?;

        tracing::info!(
            credential_id = %id,
            domain = %cred.domain,
            credential_type = %cred.credential_type,
            action,
            "Credential stored"
        );

        Ok(id)
    }

    fn list_for_owner(&self, owner_id: &str) -> Result<Vec<Credential>, StoreError> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE owner_id = ?1 ORDER BY domain, key",
            SELECT_COLUMNS
        ))?;

        let rows = stmt.query_map(params![owner_id], Self::row_to_credential)?;

        let mut credentials = Vec::new();
        for row in rows {
            credentials.push(row?);
        }
        Ok(credentials)
    }

    fn list_summaries(&self, owner_id: &str) -> Result<Vec<CredentialSummary>, StoreError> {
        Ok(self
            .list_for_owner(owner_id)?
            .into_iter()
            .map(|c| CredentialSummary {
                id: c.id,
                owner_id: c.owner_id,
                domain: c.domain,
                credential_type: c.credential_type,
                key: c.key,
                metadata: c.metadata,
                created_at: c.created_at,
                updated_at: c.updated_at,
            })
            .collect())
    }

    fn delete(&self, owner_id: &str, id: &Uuid) -> Result<bool, StoreError> {
        let conn = self.db.conn()?;
        let affected = conn.execute(
            "DELETE FROM credentials WHERE id = ?1 AND owner_id = ?2",
            params![id.to_string(), owner_id],
        )?;

        if affected > 0 {
            // The audit log has no FK, so history outlives the record.
            insert_audit(&conn, id, "deleted", owner_id, None)?;
            tracing::info!(credential_id = %id, "Credential deleted");
        }

        Ok(affected > 0)
    }

    fn get_audit_logs(&self, owner_id: &str, id: &Uuid) -> Result<Vec<String>, StoreError> {
        let conn = self.db.conn()?;

        // Deleted records keep their history, so ownership is checked on the
        // log itself when the credential row is gone.
        if !Self::owns(&conn, owner_id, id)? {
            let authored: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM audit_log WHERE credential_id = ?1 AND actor = ?2 LIMIT 1",
                    params![id.to_string(), owner_id],
                    |row| row.get(0),
                )
                .optional()?;
            if authored.is_none() {
                return Ok(Vec::new());
            }
        }

        let mut stmt = conn.prepare(
            "SELECT action, actor, timestamp, details FROM audit_log
             WHERE credential_id = ?1 ORDER BY id ASC",
        )?;

        let rows = stmt.query_map(params![id.to_string()], |row| {
            let action: String = row.get(0)?;
            let actor: String = row.get(1)?;
            let timestamp_str: String = row.get(2)?;
            let details: Option<String> = row.get(3)?;

            let dt = parse_timestamp(&timestamp_str);
            let mut formatted = format!(
                "[{}] {} by '{}'",
                dt.format("%Y-%m-%d %H:%M:%S"),
                action,
                actor
            );
            if let Some(d) = details {
                formatted.push_str(&format!(" ({})", d));
            }
            Ok(formatted)
        })?;

        let mut logs = Vec::new();
        for row in rows {
            logs.push(row?);
        }
        Ok(logs)
    }

    fn log_access(
        &self,
        credential_id: &Uuid,
        action: &str,
        actor: &str,
        details: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.db.conn()?;
        insert_audit(&conn, credential_id, action, actor, details)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
