// Conduit — SQLite Database Management
//
// Opens the record database and runs idempotent migrations. The connection
// sits behind a mutex so one handle can be shared by the async gateway and
// the execution engine; every store call holds the lock for one statement
// or one transaction and never across an await point.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::Connection;

use super::StoreError;

/// How long a writer waits on a locked database file before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Wrapper around a SQLite connection.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database at the given path.
    pub fn open(path: &std::path::Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing only).
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Lock and return the underlying connection.
    pub fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Run schema migrations to create or update tables.
    fn run_migrations(&self) -> Result<(), StoreError> {
        self.conn()?.execute_batch(
            "
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS credentials (
                id                  TEXT PRIMARY KEY,
                owner_id            TEXT NOT NULL,
                domain              TEXT NOT NULL,
                credential_type     TEXT NOT NULL,
                key                 TEXT NOT NULL,
                ciphertext          TEXT NOT NULL,
                iv                  TEXT NOT NULL,
                metadata            TEXT NOT NULL DEFAULT 'null',
                created_at          TEXT NOT NULL,
                updated_at          TEXT NOT NULL,
                UNIQUE (owner_id, domain, credential_type, key)
            );

            CREATE TABLE IF NOT EXISTS abilities (
                id                        TEXT PRIMARY KEY,
                owner_id                  TEXT NOT NULL,
                name                      TEXT NOT NULL,
                description               TEXT,
                kind                      TEXT NOT NULL,
                dynamic_headers_required  INTEGER NOT NULL DEFAULT 0,
                dynamic_header_keys       TEXT NOT NULL DEFAULT '[]',
                health_score              REAL NOT NULL DEFAULT 100.0,
                total_executions          INTEGER NOT NULL DEFAULT 0,
                successful_executions     INTEGER NOT NULL DEFAULT 0,
                is_defunct                INTEGER NOT NULL DEFAULT 0,
                last_execution_at         TEXT,
                created_at                TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS health_snapshots (
                id                      INTEGER PRIMARY KEY AUTOINCREMENT,
                ability_id              TEXT NOT NULL,
                health_score            REAL NOT NULL,
                total_executions        INTEGER NOT NULL,
                successful_executions   INTEGER NOT NULL,
                taken_at                TEXT NOT NULL,
                FOREIGN KEY(ability_id) REFERENCES abilities(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                credential_id   TEXT NOT NULL,
                action          TEXT NOT NULL,
                actor           TEXT NOT NULL,
                timestamp       TEXT NOT NULL,
                details         TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_credentials_owner
                ON credentials(owner_id);

            CREATE INDEX IF NOT EXISTS idx_abilities_owner
                ON abilities(owner_id);

            CREATE INDEX IF NOT EXISTS idx_snapshots_ability
                ON health_snapshots(ability_id, id);

            CREATE INDEX IF NOT EXISTS idx_audit_credential
                ON audit_log(credential_id);
            ",
        )?;

        tracing::debug!("Database migrations completed successfully");
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(db: &Database, name: &str) -> bool {
        let count: i64 = db
            .conn()
            .unwrap()
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name=?1",
                [name],
                |row| row.get(0),
            )
            .unwrap();
        count == 1
    }

    #[test]
    fn test_schema_migration_creates_tables() {
        let db = Database::open_in_memory().unwrap();
        for table in ["credentials", "abilities", "health_snapshots", "audit_log"] {
            assert!(table_exists(&db, table), "{} table should exist", table);
        }
    }

    #[test]
    fn test_schema_migration_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.run_migrations().is_ok(), "Migrations should be idempotent");
    }

    #[test]
    fn test_open_on_disk_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("conduit.db");

        {
            let db = Database::open(&db_path).unwrap();
            db.conn()
                .unwrap()
                .execute(
                    "INSERT INTO audit_log (credential_id, action, actor, timestamp)
                     VALUES ('c1', 'created', 'test', '2024-01-01T00:00:00Z')",
                    [],
                )
                .unwrap();
        }

        let db = Database::open(&db_path).unwrap();
        let count: i64 = db
            .conn()
            .unwrap()
            .query_row("SELECT count(*) FROM audit_log", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1, "Rows must survive a reopen");
    }

    #[test]
    fn test_credential_natural_key_is_unique() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.conn().unwrap();
        let insert = "INSERT INTO credentials
            (id, owner_id, domain, credential_type, key, ciphertext, iv, created_at, updated_at)
            VALUES (?1, 'u1', 'api.x.com', 'header', 'Authorization', 'ct', 'iv', 'now', 'now')";

        conn.execute(insert, ["a"]).unwrap();
        assert!(
            conn.execute(insert, ["b"]).is_err(),
            "(owner, domain, type, key) must be unique"
        );
    }
}
