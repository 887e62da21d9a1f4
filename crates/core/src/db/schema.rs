//! Engine table migrations and entity table DDL.
//!
//! Migrations are simple SQL strings applied in order. The SQLite
//! `user_version` pragma tracks which migrations have already been applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;
use crate::schema::EntityInfo;

/// All migrations, in order. Each entry is `(version, description, sql)`.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "id mapping and state",
        r#"
        CREATE TABLE IF NOT EXISTS vp_id_map (
            entity_type TEXT    NOT NULL,
            vp_id       TEXT    NOT NULL,
            native_id   INTEGER,
            created_at  TEXT    NOT NULL,
            updated_at  TEXT    NOT NULL,
            retired_at  TEXT,
            PRIMARY KEY (entity_type, vp_id)
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_vp_id_map_native
            ON vp_id_map (entity_type, native_id);
        CREATE INDEX IF NOT EXISTS idx_vp_id_map_vp_id ON vp_id_map (vp_id);

        CREATE TABLE IF NOT EXISTS kv_state (
            key         TEXT PRIMARY KEY,
            value       TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        "#,
    ),
    (
        2,
        "sync run history",
        r#"
        CREATE TABLE IF NOT EXISTS sync_runs (
            id            TEXT PRIMARY KEY,
            scope         TEXT    NOT NULL,
            status        TEXT    NOT NULL DEFAULT 'running',
            inserted      INTEGER NOT NULL DEFAULT 0,
            updated       INTEGER NOT NULL DEFAULT 0,
            deleted       INTEGER NOT NULL DEFAULT 0,
            unchanged     INTEGER NOT NULL DEFAULT 0,
            failed        INTEGER NOT NULL DEFAULT 0,
            details       TEXT,
            started_at    TEXT    NOT NULL,
            completed_at  TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_sync_runs_started_at ON sync_runs (started_at);
        "#,
    ),
];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(())
}

/// `CREATE TABLE IF NOT EXISTS` for one entity type: an auto-increment
/// native key followed by the declared columns.
pub fn entity_table_sql(entity: &EntityInfo) -> String {
    let mut columns = vec![format!(
        "{} INTEGER PRIMARY KEY AUTOINCREMENT",
        quote_ident(&entity.id_column)
    )];
    columns.extend(
        entity
            .fields
            .iter()
            .map(|f| format!("{} {}", quote_ident(&f.name), f.kind.sql_type())),
    );
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n);",
        quote_ident(&entity.table),
        columns.join(",\n    ")
    )
}

/// Quote an identifier for interpolation into SQL. Names are validated by
/// the schema descriptor before they get here.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Read the current schema version from the SQLite `user_version` pragma.
fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Set the schema version via the SQLite `user_version` pragma.
fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldInfo, FieldKind};

    #[test]
    fn test_migrations_run_idempotently() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 2);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .filter_map(|r| r.ok())
                .collect()
        };

        assert!(tables.contains(&"vp_id_map".to_string()));
        assert!(tables.contains(&"kv_state".to_string()));
        assert!(tables.contains(&"sync_runs".to_string()));
    }

    #[test]
    fn test_entity_table_sql() {
        let entity = EntityInfo {
            name: "post".into(),
            table: "posts".into(),
            id_column: "ID".into(),
            fields: vec![
                FieldInfo {
                    name: "post_author".into(),
                    kind: FieldKind::Integer,
                    references: Some("user".into()),
                },
                FieldInfo {
                    name: "post_title".into(),
                    kind: FieldKind::Text,
                    references: None,
                },
            ],
        };
        let sql = entity_table_sql(&entity);
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"posts\""));
        assert!(sql.contains("\"ID\" INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert!(sql.contains("\"post_author\" INTEGER"));
        assert!(sql.contains("\"post_title\" TEXT"));

        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(&sql).unwrap();
        conn.execute_batch(&sql).unwrap();
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
