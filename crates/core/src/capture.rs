//! Capture: write the current database state into the file mirror.
//!
//! Capture is the inverse of a full synchronization. Every row gets a stable
//! identifier (assigned on first sight), reference columns are rewritten
//! from native keys to stable identifiers, and the stored set is made to
//! match the table exactly. Running a full synchronization right after a
//! capture performs no row writes.
//!
//! NULL in a reference column means "no reference". A reference column
//! holding a key with no matching row is left out of the record.

use std::collections::BTreeSet;

use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::queries::{self, RowValues};
use crate::db::Database;
use crate::errors::{CoreError, DatabaseError};
use crate::models::{EntityRecord, FieldValue, VpId};
use crate::schema::{EntityInfo, SchemaInfo};
use crate::storage::StorageFactory;
use crate::translator::IdTranslator;

/// Per-type capture counts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EntityCapture {
    pub entity_type: String,
    pub saved: usize,
    pub unchanged: usize,
    pub removed: usize,
    /// Reference values that pointed at no existing row and were dropped.
    pub dangling: usize,
}

/// Outcome of a capture, in dependency order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CaptureReport {
    pub entities: Vec<EntityCapture>,
}

impl CaptureReport {
    /// Files written or removed.
    pub fn total_changes(&self) -> usize {
        self.entities.iter().map(|e| e.saved + e.removed).sum()
    }
}

/// Database to mirror export.
pub struct Capture;

impl Capture {
    /// Capture every entity type declared by `schema`.
    pub fn capture_all(
        schema: &SchemaInfo,
        db: &Database,
        storages: &StorageFactory,
    ) -> Result<CaptureReport, CoreError> {
        info!(root = %storages.root().display(), "capturing database into mirror");
        let mut report = CaptureReport::default();
        for name in schema.dependency_order() {
            let entity = schema.entity(name)?;
            report
                .entities
                .push(Self::capture_entity(schema, entity, db, storages)?);
        }
        info!(changes = report.total_changes(), "capture complete");
        Ok(report)
    }

    /// Capture one entity type.
    pub fn capture_entity(
        schema: &SchemaInfo,
        entity: &EntityInfo,
        db: &Database,
        storages: &StorageFactory,
    ) -> Result<EntityCapture, CoreError> {
        let storage = storages.get_storage(&entity.name)?;
        let mut counts = EntityCapture {
            entity_type: entity.name.clone(),
            ..Default::default()
        };

        let records = db.transaction(|conn| {
            let mut records = Vec::new();
            for (native, values) in queries::select_all_rows(conn, entity)? {
                let vp_id = stable_id_for(conn, &entity.name, native)?;
                let record = Self::to_record(conn, schema, entity, vp_id, values, &mut counts)?;
                records.push(record);
            }
            Ok::<_, DatabaseError>(records)
        })?;

        let mut captured = BTreeSet::new();
        for record in &records {
            if storage.save(record)? {
                counts.saved += 1;
            } else {
                counts.unchanged += 1;
            }
            captured.insert(record.vp_id.clone());
        }

        for vp_id in storage.ids()? {
            if captured.contains(&vp_id) {
                continue;
            }
            storage.delete(&vp_id)?;
            {
                let conn = db.conn();
                IdTranslator::retire_mapping(&conn, &entity.name, &vp_id)?;
            }
            debug!(entity_type = %entity.name, %vp_id, "removed record with no row");
            counts.removed += 1;
        }

        info!(
            entity_type = %entity.name,
            saved = counts.saved,
            unchanged = counts.unchanged,
            removed = counts.removed,
            "captured entity type"
        );
        Ok(counts)
    }

    fn to_record(
        conn: &Connection,
        schema: &SchemaInfo,
        entity: &EntityInfo,
        vp_id: VpId,
        values: RowValues,
        counts: &mut EntityCapture,
    ) -> Result<EntityRecord, DatabaseError> {
        let mut record = EntityRecord::new(vp_id);
        for (name, value) in values {
            if value.is_null() {
                continue;
            }
            let reference = entity.field(&name).and_then(|f| f.references.as_deref());
            let value = match reference {
                None => value,
                Some(target_type) => {
                    match reference_target(conn, schema, target_type, &value)? {
                        Some(target) => FieldValue::from(&target),
                        None => {
                            warn!(
                                entity_type = %entity.name,
                                vp_id = %record.vp_id,
                                field = %name,
                                value = %value,
                                "reference points at no existing row, leaving it out"
                            );
                            counts.dangling += 1;
                            continue;
                        }
                    }
                }
            };
            record.fields.insert(name, value);
        }
        Ok(record)
    }
}

/// The stable identifier of a row, assigning a fresh one on first sight.
fn stable_id_for(conn: &Connection, entity_type: &str, native: i64) -> Result<VpId, DatabaseError> {
    if let Some(vp_id) = IdTranslator::get_stable_id(conn, entity_type, native)? {
        return Ok(vp_id);
    }
    let vp_id = VpId::generate();
    IdTranslator::register_mapping(conn, entity_type, &vp_id, native)?;
    debug!(entity_type, native, %vp_id, "assigned stable identifier");
    Ok(vp_id)
}

/// Translate a native key held in a reference column. Keys of rows that do
/// not exist yield `None`.
fn reference_target(
    conn: &Connection,
    schema: &SchemaInfo,
    target_type: &str,
    value: &FieldValue,
) -> Result<Option<VpId>, DatabaseError> {
    let Some(native) = value.as_integer() else {
        return Ok(None);
    };
    if let Some(vp_id) = IdTranslator::get_stable_id(conn, target_type, native)? {
        return Ok(Some(vp_id));
    }
    let Ok(target) = schema.entity(target_type) else {
        return Ok(None);
    };
    if queries::select_row(conn, target, native)?.is_none() {
        return Ok(None);
    }
    stable_id_for(conn, target_type, native).map(Some)
}
