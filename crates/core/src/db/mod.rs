//! SQLite persistence layer.
//!
//! Provides a [`Database`] handle with WAL-mode journaling, automatic schema
//! migrations for the engine's own tables, creation of entity tables from the
//! schema descriptor, and query helpers.

pub mod queries;
pub mod schema;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, TransactionBehavior};
use tracing::{debug, info};

use crate::errors::DatabaseError;
use crate::schema::SchemaInfo;

/// Main database handle wrapping a SQLite connection.
///
/// The connection is opened in WAL mode so the live application can keep
/// reading while a pass runs, with a busy timeout so writers wait instead of
/// failing immediately. The inner connection is wrapped in a `Mutex` so that
/// `Database` is `Send + Sync`, enabling use inside `Arc`.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a SQLite database at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening database");

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;

        debug!("database opened successfully with WAL mode");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (useful for testing).
    pub fn in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run all schema migrations to bring the engine tables up to date.
    pub fn initialize(&self) -> Result<(), DatabaseError> {
        info!("initializing database schema");
        let conn = self.conn();
        schema::run_migrations(&conn)?;
        debug!("database schema is up to date");
        Ok(())
    }

    /// Create every entity table the schema declares that does not exist yet.
    /// Existing tables are left alone.
    pub fn ensure_entity_tables(&self, schema: &SchemaInfo) -> Result<(), DatabaseError> {
        let conn = self.conn();
        for entity in schema.entities() {
            let sql = schema::entity_table_sql(entity);
            conn.execute_batch(&sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version: 0,
                    detail: format!("creating table '{}': {}", entity.table, e),
                })?;
            debug!(entity_type = %entity.name, table = %entity.table, "entity table ready");
        }
        Ok(())
    }

    /// Obtain a lock on the underlying connection.
    ///
    /// If the Mutex is poisoned (a previous holder panicked), the lock is
    /// recovered rather than propagating a panic.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("database mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Execute a closure inside a SQLite transaction. If the closure returns
    /// `Ok`, the transaction is committed; otherwise it is rolled back.
    ///
    /// The transaction is `IMMEDIATE`: the write lock is taken up front, so a
    /// concurrent writer is waited for under `busy_timeout` instead of
    /// failing a read-then-write sequence with `SQLITE_BUSY_SNAPSHOT`.
    ///
    /// The closure must not call back into [`Database::conn`]; it receives
    /// the connection it should use.
    pub fn transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
        E: From<DatabaseError>,
    {
        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(DatabaseError::from)?;
        let result = f(&tx)?;
        tx.commit().map_err(DatabaseError::from)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_database() {
        let db = Database::in_memory().expect("failed to create in-memory db");
        db.initialize().expect("failed to initialize schema");
    }

    #[test]
    fn test_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("test.db");
        let db = Database::new(&path).expect("failed to create file db");
        db.initialize().expect("failed to initialize schema");
        assert!(path.exists());
    }

    #[test]
    fn test_transaction_commit() {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();

        db.transaction(|conn| {
            conn.execute(
                "INSERT INTO kv_state (key, value, updated_at) VALUES (?1, ?2, ?3)",
                rusqlite::params!["test", "42", "2025-01-01T00:00:00Z"],
            )?;
            Ok::<_, DatabaseError>(())
        })
        .unwrap();

        assert_eq!(db.get_state("test").unwrap().as_deref(), Some("42"));
    }

    #[test]
    fn test_transaction_rollback() {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();

        let result: Result<(), DatabaseError> = db.transaction(|conn| {
            conn.execute(
                "INSERT INTO kv_state (key, value, updated_at) VALUES (?1, ?2, ?3)",
                rusqlite::params!["rollback_test", "99", "2025-01-01T00:00:00Z"],
            )?;
            Err(DatabaseError::NotFound {
                entity: "test".into(),
                id: "forced".into(),
            })
        });
        assert!(result.is_err());
        assert!(db.get_state("rollback_test").unwrap().is_none());
    }

    #[test]
    fn test_transaction_takes_write_lock_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock.db");
        let db = Database::new(&path).unwrap();
        db.initialize().unwrap();
        let other = Database::new(&path).unwrap();
        other
            .conn()
            .busy_timeout(std::time::Duration::ZERO)
            .unwrap();

        // No statement has run yet, but another writer is already shut out.
        db.transaction(|_conn| {
            let blocked = other.conn().execute_batch("BEGIN IMMEDIATE; COMMIT;");
            assert!(blocked.is_err());
            Ok::<_, DatabaseError>(())
        })
        .unwrap();

        other
            .conn()
            .execute_batch("BEGIN IMMEDIATE; COMMIT;")
            .unwrap();
    }
}
