//! Typed query helpers.
//!
//! Methods on [`Database`] lock the connection themselves and serve the
//! engine's bookkeeping tables. The free functions operate on entity tables
//! and take the `&Connection` of an enclosing transaction, so row writes and
//! id mapping changes commit together.

use std::collections::BTreeMap;

use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::debug;

use super::schema::quote_ident;
use super::Database;
use crate::errors::DatabaseError;
use crate::models::FieldValue;
use crate::schema::EntityInfo;

/// Column values of one entity row, keyed by column name.
pub type RowValues = BTreeMap<String, FieldValue>;

// ---------------------------------------------------------------------------
// Domain structs returned by queries
// ---------------------------------------------------------------------------

/// Per-run write counts stored in `sync_runs`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounts {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub failed: usize,
}

/// A row from the `sync_runs` table.
#[derive(Debug, Clone)]
pub struct SyncRunEntry {
    pub id: String,
    pub scope: String,
    pub status: String,
    pub counts: RunCounts,
    pub details: Option<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
}

impl SyncRunEntry {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            scope: row.get(1)?,
            status: row.get(2)?,
            counts: RunCounts {
                inserted: row.get::<_, i64>(3)? as usize,
                updated: row.get::<_, i64>(4)? as usize,
                deleted: row.get::<_, i64>(5)? as usize,
                unchanged: row.get::<_, i64>(6)? as usize,
                failed: row.get::<_, i64>(7)? as usize,
            },
            details: row.get(8)?,
            started_at: row.get(9)?,
            completed_at: row.get(10)?,
        })
    }
}

const SYNC_RUN_COLUMNS: &str = "id, scope, status, inserted, updated, deleted, unchanged, \
                                failed, details, started_at, completed_at";

// ---------------------------------------------------------------------------
// Engine tables
// ---------------------------------------------------------------------------

impl Database {
    // -- kv_state -----------------------------------------------------------

    /// Get a key-value state entry.
    pub fn get_state(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let conn = self.conn();
        let value = conn
            .query_row(
                "SELECT value FROM kv_state WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Set a key-value state entry (upsert).
    pub fn set_state(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO kv_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        debug!(key, value, "set kv_state");
        Ok(())
    }

    // -- sync_runs ----------------------------------------------------------

    /// Record the start of a synchronization run.
    pub fn start_sync_run(&self, id: &str, scope: &str) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO sync_runs (id, scope, status, started_at) VALUES (?1, ?2, 'running', ?3)",
            params![id, scope, now],
        )?;
        debug!(id, scope, "started sync run");
        Ok(())
    }

    /// Mark a run as finished with its final status and counts.
    pub fn complete_sync_run(
        &self,
        id: &str,
        status: &str,
        counts: &RunCounts,
        details: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE sync_runs SET status = ?1, inserted = ?2, updated = ?3, deleted = ?4,
             unchanged = ?5, failed = ?6, details = ?7, completed_at = ?8 WHERE id = ?9",
            params![
                status,
                counts.inserted as i64,
                counts.updated as i64,
                counts.deleted as i64,
                counts.unchanged as i64,
                counts.failed as i64,
                details,
                now,
                id
            ],
        )?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "sync_run".into(),
                id: id.to_string(),
            });
        }
        debug!(id, status, "completed sync run");
        Ok(())
    }

    /// Most recent runs, newest first.
    pub fn list_sync_runs(&self, limit: u32) -> Result<Vec<SyncRunEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sync_runs ORDER BY started_at DESC, rowid DESC LIMIT ?1",
            SYNC_RUN_COLUMNS
        ))?;
        let entries = stmt
            .query_map(params![limit], SyncRunEntry::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Look up one run by id.
    pub fn get_sync_run(&self, id: &str) -> Result<Option<SyncRunEntry>, DatabaseError> {
        let conn = self.conn();
        let entry = conn
            .query_row(
                &format!("SELECT {} FROM sync_runs WHERE id = ?1", SYNC_RUN_COLUMNS),
                params![id],
                SyncRunEntry::from_row,
            )
            .optional()?;
        Ok(entry)
    }

    // -- entity tables ------------------------------------------------------

    /// Number of rows in an entity table.
    pub fn count_rows(&self, entity: &EntityInfo) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        count_rows(&conn, entity)
    }

    /// Every row of an entity table, keyed by native key.
    pub fn load_rows(&self, entity: &EntityInfo) -> Result<BTreeMap<i64, RowValues>, DatabaseError> {
        let conn = self.conn();
        Ok(select_all_rows(&conn, entity)?.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// Entity row helpers (run inside the caller's transaction)
// ---------------------------------------------------------------------------

fn column_list(entity: &EntityInfo) -> String {
    entity
        .fields
        .iter()
        .map(|f| quote_ident(&f.name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn read_values(entity: &EntityInfo, row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<RowValues> {
    let mut values = RowValues::new();
    for (i, field) in entity.fields.iter().enumerate() {
        values.insert(field.name.clone(), row.get::<_, FieldValue>(offset + i)?);
    }
    Ok(values)
}

/// Fetch one row by native key.
pub fn select_row(
    conn: &Connection,
    entity: &EntityInfo,
    native_id: i64,
) -> Result<Option<RowValues>, DatabaseError> {
    let sql = if entity.fields.is_empty() {
        format!(
            "SELECT {id} FROM {table} WHERE {id} = ?1",
            id = quote_ident(&entity.id_column),
            table = quote_ident(&entity.table)
        )
    } else {
        format!(
            "SELECT {cols} FROM {table} WHERE {id} = ?1",
            cols = column_list(entity),
            table = quote_ident(&entity.table),
            id = quote_ident(&entity.id_column)
        )
    };
    let row = conn
        .query_row(&sql, params![native_id], |row| {
            if entity.fields.is_empty() {
                Ok(RowValues::new())
            } else {
                read_values(entity, row, 0)
            }
        })
        .optional()?;
    Ok(row)
}

/// Fetch every row of the table, ordered by native key.
pub fn select_all_rows(
    conn: &Connection,
    entity: &EntityInfo,
) -> Result<Vec<(i64, RowValues)>, DatabaseError> {
    let mut cols = vec![quote_ident(&entity.id_column)];
    if !entity.fields.is_empty() {
        cols.push(column_list(entity));
    }
    let sql = format!(
        "SELECT {} FROM {} ORDER BY {}",
        cols.join(", "),
        quote_ident(&entity.table),
        quote_ident(&entity.id_column)
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(0)?, read_values(entity, row, 1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Native keys of every row in the table.
pub fn list_native_ids(conn: &Connection, entity: &EntityInfo) -> Result<Vec<i64>, DatabaseError> {
    let sql = format!(
        "SELECT {id} FROM {table} ORDER BY {id}",
        id = quote_ident(&entity.id_column),
        table = quote_ident(&entity.table)
    );
    let mut stmt = conn.prepare(&sql)?;
    let ids = stmt
        .query_map([], |row| row.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Native keys of rows whose `column` holds `target_native_id`.
pub fn native_ids_referencing(
    conn: &Connection,
    entity: &EntityInfo,
    column: &str,
    target_native_id: i64,
) -> Result<Vec<i64>, DatabaseError> {
    let sql = format!(
        "SELECT {id} FROM {table} WHERE {col} = ?1 ORDER BY {id}",
        id = quote_ident(&entity.id_column),
        table = quote_ident(&entity.table),
        col = quote_ident(column)
    );
    let mut stmt = conn.prepare(&sql)?;
    let ids = stmt
        .query_map(params![target_native_id], |row| row.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn ordered_values<'a>(entity: &EntityInfo, values: &'a RowValues) -> Vec<&'a FieldValue> {
    entity
        .fields
        .iter()
        .map(|f| values.get(&f.name).unwrap_or(&FieldValue::Null))
        .collect()
}

/// Insert a row and return the native key the database assigned.
pub fn insert_row(
    conn: &Connection,
    entity: &EntityInfo,
    values: &RowValues,
) -> Result<i64, DatabaseError> {
    if entity.fields.is_empty() {
        conn.execute(
            &format!("INSERT INTO {} DEFAULT VALUES", quote_ident(&entity.table)),
            [],
        )?;
    } else {
        let placeholders: Vec<String> = (1..=entity.fields.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(&entity.table),
            column_list(entity),
            placeholders.join(", ")
        );
        conn.execute(&sql, params_from_iter(ordered_values(entity, values)))?;
    }
    let id = conn.last_insert_rowid();
    debug!(table = %entity.table, id, "inserted row");
    Ok(id)
}

/// Overwrite every declared column of an existing row.
pub fn update_row(
    conn: &Connection,
    entity: &EntityInfo,
    native_id: i64,
    values: &RowValues,
) -> Result<(), DatabaseError> {
    if entity.fields.is_empty() {
        return Ok(());
    }
    let assignments: Vec<String> = entity
        .fields
        .iter()
        .enumerate()
        .map(|(i, f)| format!("{} = ?{}", quote_ident(&f.name), i + 1))
        .collect();
    let sql = format!(
        "UPDATE {} SET {} WHERE {} = ?{}",
        quote_ident(&entity.table),
        assignments.join(", "),
        quote_ident(&entity.id_column),
        entity.fields.len() + 1
    );
    let native = FieldValue::Integer(native_id);
    let mut bound = ordered_values(entity, values);
    bound.push(&native);
    let changed = conn.execute(&sql, params_from_iter(bound))?;
    if changed == 0 {
        return Err(DatabaseError::NotFound {
            entity: entity.table.clone(),
            id: native_id.to_string(),
        });
    }
    debug!(table = %entity.table, id = native_id, "updated row");
    Ok(())
}

/// Delete a row. Returns whether a row was removed.
pub fn delete_row(conn: &Connection, entity: &EntityInfo, native_id: i64) -> Result<bool, DatabaseError> {
    let sql = format!(
        "DELETE FROM {} WHERE {} = ?1",
        quote_ident(&entity.table),
        quote_ident(&entity.id_column)
    );
    let changed = conn.execute(&sql, params![native_id])?;
    debug!(table = %entity.table, id = native_id, removed = changed > 0, "deleted row");
    Ok(changed > 0)
}

/// Number of rows in the table.
pub fn count_rows(conn: &Connection, entity: &EntityInfo) -> Result<i64, DatabaseError> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", quote_ident(&entity.table)),
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldInfo, FieldKind};

    fn setup_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn note_entity() -> EntityInfo {
        EntityInfo {
            name: "note".into(),
            table: "notes".into(),
            id_column: "id".into(),
            fields: vec![
                FieldInfo {
                    name: "body".into(),
                    kind: FieldKind::Text,
                    references: None,
                },
                FieldInfo {
                    name: "owner".into(),
                    kind: FieldKind::Integer,
                    references: Some("user".into()),
                },
            ],
        }
    }

    fn values(body: &str, owner: Option<i64>) -> RowValues {
        let mut v = RowValues::new();
        v.insert("body".into(), FieldValue::Text(body.into()));
        v.insert(
            "owner".into(),
            owner.map(FieldValue::Integer).unwrap_or(FieldValue::Null),
        );
        v
    }

    #[test]
    fn test_kv_state() {
        let db = setup_db();
        assert!(db.get_state("foo").unwrap().is_none());
        db.set_state("foo", "bar").unwrap();
        assert_eq!(db.get_state("foo").unwrap().as_deref(), Some("bar"));
        db.set_state("foo", "baz").unwrap();
        assert_eq!(db.get_state("foo").unwrap().as_deref(), Some("baz"));
    }

    #[test]
    fn test_sync_run_lifecycle() {
        let db = setup_db();
        db.start_sync_run("run-1", "everything").unwrap();
        let counts = RunCounts {
            inserted: 3,
            failed: 1,
            ..Default::default()
        };
        db.complete_sync_run("run-1", "partial", &counts, Some("1 failure"))
            .unwrap();

        let run = db.get_sync_run("run-1").unwrap().unwrap();
        assert_eq!(run.status, "partial");
        assert_eq!(run.counts, counts);
        assert!(run.completed_at.is_some());
        assert_eq!(db.list_sync_runs(10).unwrap().len(), 1);

        let missing = db.complete_sync_run("nope", "ok", &counts, None);
        assert!(matches!(missing, Err(DatabaseError::NotFound { .. })));
    }

    #[test]
    fn test_row_crud() {
        let db = setup_db();
        let entity = note_entity();
        db.conn()
            .execute_batch(&crate::db::schema::entity_table_sql(&entity))
            .unwrap();

        let conn = db.conn();
        let id = insert_row(&conn, &entity, &values("hello", Some(7))).unwrap();
        assert_eq!(id, 1);
        assert_eq!(
            select_row(&conn, &entity, id).unwrap(),
            Some(values("hello", Some(7)))
        );

        update_row(&conn, &entity, id, &values("bye", None)).unwrap();
        assert_eq!(
            select_row(&conn, &entity, id).unwrap(),
            Some(values("bye", None))
        );

        let other = insert_row(&conn, &entity, &values("x", Some(7))).unwrap();
        assert_eq!(list_native_ids(&conn, &entity).unwrap(), vec![id, other]);
        assert_eq!(
            native_ids_referencing(&conn, &entity, "owner", 7).unwrap(),
            vec![other]
        );
        assert_eq!(select_all_rows(&conn, &entity).unwrap().len(), 2);

        assert!(delete_row(&conn, &entity, id).unwrap());
        assert!(!delete_row(&conn, &entity, id).unwrap());
        assert!(select_row(&conn, &entity, id).unwrap().is_none());
        assert!(matches!(
            update_row(&conn, &entity, id, &values("gone", None)),
            Err(DatabaseError::NotFound { .. })
        ));
        assert_eq!(count_rows(&conn, &entity).unwrap(), 1);
    }
}
