//! Stable identifier <-> native key translation.
//!
//! Mappings live in the `vp_id_map` table of the same database as the entity
//! rows, so a row write and its mapping change commit in one transaction.
//! Every function takes the `&Connection` of the caller's transaction.
//!
//! A mapping is *active* while it has a native key. Deleting an entity
//! retires its mapping (native key cleared, `retired_at` set) instead of
//! removing it, so the stable identifier is never handed to another row.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::errors::DatabaseError;
use crate::models::VpId;

/// An active mapping of one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub vp_id: VpId,
    pub native_id: i64,
}

/// Translation between stable identifiers and native keys.
pub struct IdTranslator;

impl IdTranslator {
    /// The native key currently assigned to `vp_id`, if it has one.
    pub fn get_native_key(
        conn: &Connection,
        entity_type: &str,
        vp_id: &VpId,
    ) -> Result<Option<i64>, DatabaseError> {
        let native = conn
            .query_row(
                "SELECT native_id FROM vp_id_map
                 WHERE entity_type = ?1 AND vp_id = ?2 AND native_id IS NOT NULL",
                params![entity_type, vp_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(native)
    }

    /// The stable identifier of the row with native key `native_id`.
    pub fn get_stable_id(
        conn: &Connection,
        entity_type: &str,
        native_id: i64,
    ) -> Result<Option<VpId>, DatabaseError> {
        let vp_id = conn
            .query_row(
                "SELECT vp_id FROM vp_id_map WHERE entity_type = ?1 AND native_id = ?2",
                params![entity_type, native_id],
                |row| row.get::<_, VpId>(0),
            )
            .optional()?;
        Ok(vp_id)
    }

    /// Record that `vp_id` is stored under `native_id`.
    ///
    /// Any other identifier still holding `native_id` is retired first, so
    /// the mapping stays one-to-one. Re-registering a retired identifier
    /// reactivates it.
    pub fn register_mapping(
        conn: &Connection,
        entity_type: &str,
        vp_id: &VpId,
        native_id: i64,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let displaced = conn.execute(
            "UPDATE vp_id_map SET native_id = NULL, retired_at = ?1, updated_at = ?1
             WHERE entity_type = ?2 AND native_id = ?3 AND vp_id != ?4",
            params![now, entity_type, native_id, vp_id],
        )?;
        if displaced > 0 {
            debug!(entity_type, native_id, "retired stale mapping for reused native key");
        }

        conn.execute(
            "INSERT INTO vp_id_map (entity_type, vp_id, native_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(entity_type, vp_id) DO UPDATE SET
                native_id = excluded.native_id,
                updated_at = excluded.updated_at,
                retired_at = NULL",
            params![entity_type, vp_id, native_id, now],
        )?;
        debug!(entity_type, %vp_id, native_id, "registered mapping");
        Ok(())
    }

    /// Retire the mapping of `vp_id`. Returns whether an active mapping was
    /// retired.
    pub fn retire_mapping(
        conn: &Connection,
        entity_type: &str,
        vp_id: &VpId,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let changed = conn.execute(
            "UPDATE vp_id_map SET native_id = NULL, retired_at = ?1, updated_at = ?1
             WHERE entity_type = ?2 AND vp_id = ?3 AND native_id IS NOT NULL",
            params![now, entity_type, vp_id],
        )?;
        if changed > 0 {
            debug!(entity_type, %vp_id, "retired mapping");
        }
        Ok(changed > 0)
    }

    /// Whether `vp_id` was once mapped and has since been retired.
    pub fn is_retired(
        conn: &Connection,
        entity_type: &str,
        vp_id: &VpId,
    ) -> Result<bool, DatabaseError> {
        let retired = conn
            .query_row(
                "SELECT retired_at IS NOT NULL FROM vp_id_map
                 WHERE entity_type = ?1 AND vp_id = ?2",
                params![entity_type, vp_id],
                |row| row.get::<_, bool>(0),
            )
            .optional()?;
        Ok(retired.unwrap_or(false))
    }

    /// Active mappings of one entity type, ordered by native key.
    pub fn list_mappings(conn: &Connection, entity_type: &str) -> Result<Vec<Mapping>, DatabaseError> {
        let mut stmt = conn.prepare(
            "SELECT vp_id, native_id FROM vp_id_map
             WHERE entity_type = ?1 AND native_id IS NOT NULL
             ORDER BY native_id",
        )?;
        let mappings = stmt
            .query_map(params![entity_type], |row| {
                Ok(Mapping {
                    vp_id: row.get(0)?,
                    native_id: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(mappings)
    }

    /// Number of active mappings of one entity type.
    pub fn count_mappings(conn: &Connection, entity_type: &str) -> Result<i64, DatabaseError> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM vp_id_map WHERE entity_type = ?1 AND native_id IS NOT NULL",
            params![entity_type],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// The entity type a stable identifier has been registered under, if any.
    pub fn find_entity_type(conn: &Connection, vp_id: &VpId) -> Result<Option<String>, DatabaseError> {
        let entity_type = conn
            .query_row(
                "SELECT entity_type FROM vp_id_map WHERE vp_id = ?1
                 ORDER BY native_id IS NULL, entity_type LIMIT 1",
                params![vp_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(entity_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn setup_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn id(s: &str) -> VpId {
        VpId::parse(s).unwrap()
    }

    #[test]
    fn test_register_and_lookup() {
        let db = setup_db();
        let conn = db.conn();

        assert!(IdTranslator::get_native_key(&conn, "post", &id("P1")).unwrap().is_none());
        IdTranslator::register_mapping(&conn, "post", &id("P1"), 10).unwrap();

        assert_eq!(
            IdTranslator::get_native_key(&conn, "post", &id("P1")).unwrap(),
            Some(10)
        );
        assert_eq!(
            IdTranslator::get_stable_id(&conn, "post", 10).unwrap(),
            Some(id("P1"))
        );
        // Mappings are scoped per entity type.
        assert!(IdTranslator::get_native_key(&conn, "user", &id("P1")).unwrap().is_none());
        assert!(IdTranslator::get_stable_id(&conn, "user", 10).unwrap().is_none());
    }

    #[test]
    fn test_register_replaces_native_key() {
        let db = setup_db();
        let conn = db.conn();
        IdTranslator::register_mapping(&conn, "post", &id("P1"), 10).unwrap();
        IdTranslator::register_mapping(&conn, "post", &id("P1"), 11).unwrap();

        assert_eq!(
            IdTranslator::get_native_key(&conn, "post", &id("P1")).unwrap(),
            Some(11)
        );
        assert!(IdTranslator::get_stable_id(&conn, "post", 10).unwrap().is_none());
        assert_eq!(IdTranslator::count_mappings(&conn, "post").unwrap(), 1);
    }

    #[test]
    fn test_reused_native_key_displaces_old_mapping() {
        let db = setup_db();
        let conn = db.conn();
        IdTranslator::register_mapping(&conn, "post", &id("P1"), 10).unwrap();
        IdTranslator::register_mapping(&conn, "post", &id("P2"), 10).unwrap();

        assert!(IdTranslator::get_native_key(&conn, "post", &id("P1")).unwrap().is_none());
        assert!(IdTranslator::is_retired(&conn, "post", &id("P1")).unwrap());
        assert_eq!(
            IdTranslator::get_stable_id(&conn, "post", 10).unwrap(),
            Some(id("P2"))
        );
    }

    #[test]
    fn test_retire_and_reactivate() {
        let db = setup_db();
        let conn = db.conn();
        IdTranslator::register_mapping(&conn, "user", &id("U1"), 1).unwrap();

        assert!(IdTranslator::retire_mapping(&conn, "user", &id("U1")).unwrap());
        assert!(!IdTranslator::retire_mapping(&conn, "user", &id("U1")).unwrap());
        assert!(IdTranslator::get_native_key(&conn, "user", &id("U1")).unwrap().is_none());
        assert!(IdTranslator::is_retired(&conn, "user", &id("U1")).unwrap());
        assert_eq!(IdTranslator::count_mappings(&conn, "user").unwrap(), 0);
        assert_eq!(
            IdTranslator::find_entity_type(&conn, &id("U1")).unwrap().as_deref(),
            Some("user")
        );

        IdTranslator::register_mapping(&conn, "user", &id("U1"), 5).unwrap();
        assert!(!IdTranslator::is_retired(&conn, "user", &id("U1")).unwrap());
        assert_eq!(
            IdTranslator::list_mappings(&conn, "user").unwrap(),
            vec![Mapping {
                vp_id: id("U1"),
                native_id: 5
            }]
        );
    }

    #[test]
    fn test_unknown_identifier() {
        let db = setup_db();
        let conn = db.conn();
        assert!(!IdTranslator::is_retired(&conn, "user", &id("NOPE")).unwrap());
        assert!(IdTranslator::find_entity_type(&conn, &id("NOPE")).unwrap().is_none());
    }
}
