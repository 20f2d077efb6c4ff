// Conduit — Ability Store Repository
//
// Persists abilities, their health counters and the append-only health
// snapshot history. Health counters change only through
// `compare_and_set_health`, a single conditional UPDATE, so concurrent
// executions of one ability can never lose an increment.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::db::Database;
use super::models::{Ability, AbilityKind, HealthSnapshot, HealthState};
use super::{parse_timestamp, StoreError};

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over ability storage operations.
pub trait AbilityStore: Send + Sync {
    /// Insert a new ability. Fails with `Conflict` if the id is taken.
    fn insert(&self, ability: &Ability) -> Result<(), StoreError>;

    /// Load an ability by id.
    fn get(&self, id: &str) -> Result<Option<Ability>, StoreError>;

    /// All abilities owned by `owner_id`, newest first.
    fn list_for_owner(&self, owner_id: &str) -> Result<Vec<Ability>, StoreError>;

    /// Replace the health counters with `next` only if they still equal
    /// `expected`. Returns false when another writer got there first.
    fn compare_and_set_health(
        &self,
        id: &str,
        expected: &HealthState,
        next: &HealthState,
        executed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Restore `{100, 0, 0, active}`. Returns true if the ability exists.
    fn reset_health(&self, id: &str) -> Result<bool, StoreError>;

    /// Append an immutable health snapshot.
    fn append_snapshot(&self, snapshot: &HealthSnapshot) -> Result<(), StoreError>;

    /// The most recent `limit` snapshots, newest first.
    fn recent_snapshots(&self, id: &str, limit: usize) -> Result<Vec<HealthSnapshot>, StoreError>;
}

// ─── SQLite Implementation ──────────────────────────────────────────────────

pub struct SqliteAbilityStore<'a> {
    db: &'a Database,
}

impl<'a> SqliteAbilityStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    fn row_to_ability(row: &rusqlite::Row<'_>) -> rusqlite::Result<Ability> {
        let kind_json: String = row.get(4)?;
        let keys_json: String = row.get(6)?;
        let last_execution_at: Option<String> = row.get(11)?;
        let created_at_str: String = row.get(12)?;

        let kind: AbilityKind = serde_json::from_str(&kind_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;
        let dynamic_header_keys: Vec<String> = serde_json::from_str(&keys_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?;

        let total: i64 = row.get(8)?;
        let successful: i64 = row.get(9)?;

        Ok(Ability {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            kind,
            dynamic_headers_required: row.get(5)?,
            dynamic_header_keys,
            health: HealthState {
                health_score: row.get(7)?,
                total_executions: total.max(0) as u64,
                successful_executions: successful.max(0) as u64,
                is_defunct: row.get(10)?,
            },
            last_execution_at: last_execution_at.as_deref().map(parse_timestamp),
            created_at: parse_timestamp(&created_at_str),
        })
    }

    fn row_to_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<HealthSnapshot> {
        let total: i64 = row.get(2)?;
        let successful: i64 = row.get(3)?;
        let taken_at: String = row.get(4)?;
        Ok(HealthSnapshot {
            ability_id: row.get(0)?,
            health_score: row.get(1)?,
            total_executions: total.max(0) as u64,
            successful_executions: successful.max(0) as u64,
            taken_at: parse_timestamp(&taken_at),
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT id, owner_id, name, description, kind,
        dynamic_headers_required, dynamic_header_keys, health_score,
        total_executions, successful_executions, is_defunct,
        last_execution_at, created_at
     FROM abilities";

impl<'a> AbilityStore for SqliteAbilityStore<'a> {
    fn insert(&self, ability: &Ability) -> Result<(), StoreError> {
        let kind_json = serde_json::to_string(&ability.kind)?;
        let keys_json = serde_json::to_string(&ability.dynamic_header_keys)?;

        let conn = self.db.conn()?;
        let result = conn.execute(
            "INSERT INTO abilities
                (id, owner_id, name, description, kind,
                 dynamic_headers_required, dynamic_header_keys, health_score,
                 total_executions, successful_executions, is_defunct,
                 last_execution_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                ability.id,
                ability.owner_id,
                ability.name,
                ability.description,
                kind_json,
                ability.dynamic_headers_required,
                keys_json,
                ability.health.health_score,
                ability.health.total_executions as i64,
                ability.health.successful_executions as i64,
                ability.health.is_defunct,
                ability.last_execution_at.map(|t| t.to_rfc3339()),
                ability.created_at.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(StoreError::Conflict(ability.id.clone()));
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(
            ability_id = %ability.id,
            name = %ability.name,
            workflow = ability.is_workflow(),
            "Ability stored"
        );
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Ability>, StoreError> {
        let conn = self.db.conn()?;
        let ability = conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_COLUMNS),
                params![id],
                Self::row_to_ability,
            )
            .optional()?;
        Ok(ability)
    }

    fn list_for_owner(&self, owner_id: &str) -> Result<Vec<Ability>, StoreError> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE owner_id = ?1 ORDER BY created_at DESC",
            SELECT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![owner_id], Self::row_to_ability)?;

        let mut abilities = Vec::new();
        for row in rows {
            abilities.push(row?);
        }
        Ok(abilities)
    }

    fn compare_and_set_health(
        &self,
        id: &str,
        expected: &HealthState,
        next: &HealthState,
        executed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.db.conn()?;
        let affected = conn.execute(
            "UPDATE abilities
             SET health_score = ?2,
                 total_executions = ?3,
                 successful_executions = ?4,
                 is_defunct = ?5,
                 last_execution_at = ?6
             WHERE id = ?1
               AND total_executions = ?7
               AND successful_executions = ?8
               AND is_defunct = ?9",
            params![
                id,
                next.health_score,
                next.total_executions as i64,
                next.successful_executions as i64,
                next.is_defunct,
                executed_at.to_rfc3339(),
                expected.total_executions as i64,
                expected.successful_executions as i64,
                expected.is_defunct,
            ],
        )?;
        Ok(affected == 1)
    }

    fn reset_health(&self, id: &str) -> Result<bool, StoreError> {
        let defaults = HealthState::default();
        let conn = self.db.conn()?;
        let affected = conn.execute(
            "UPDATE abilities
             SET health_score = ?2, total_executions = ?3,
                 successful_executions = ?4, is_defunct = ?5
             WHERE id = ?1",
            params![
                id,
                defaults.health_score,
                defaults.total_executions as i64,
                defaults.successful_executions as i64,
                defaults.is_defunct,
            ],
        )?;
        Ok(affected == 1)
    }

    fn append_snapshot(&self, snapshot: &HealthSnapshot) -> Result<(), StoreError> {
        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO health_snapshots
                (ability_id, health_score, total_executions, successful_executions, taken_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                snapshot.ability_id,
                snapshot.health_score,
                snapshot.total_executions as i64,
                snapshot.successful_executions as i64,
                snapshot.taken_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn recent_snapshots(&self, id: &str, limit: usize) -> Result<Vec<HealthSnapshot>, StoreError> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(
            "SELECT ability_id, health_score, total_executions, successful_executions, taken_at
             FROM health_snapshots WHERE ability_id = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![id, limit as i64], Self::row_to_snapshot)?;

        let mut snapshots = Vec::new();
        for row in rows {
            snapshots.push(row?);
        }
        Ok(snapshots)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
