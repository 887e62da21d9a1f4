//! Schema-driven synchronizer for one entity table.
//!
//! A pass runs in three phases:
//!
//! 1. Work out the targets: every stored or mapped entity for a full pass,
//!    or the listed entities that belong to this type for a selective one.
//! 2. Upsert every target present in storage. Records of a self-referencing
//!    type are ordered parents first so a child's reference resolves within
//!    the same pass.
//! 3. Delete the rows of mapped targets that are gone from storage, then
//!    (full pass only) sweep rows that no mapping accounts for.
//!
//! Every row write commits together with its mapping change.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rusqlite::Connection;
use tracing::{debug, info, warn};

use super::{EntityAction, SyncReport, Synchronizer, SynchronizerOptions};
use crate::db::queries::{self, RowValues};
use crate::db::Database;
use crate::errors::SyncError;
use crate::models::{EntityRecord, FieldValue, SyncScope, VpId};
use crate::schema::{EntityInfo, SchemaInfo};
use crate::storage::EntityStorage;
use crate::translator::IdTranslator;

/// Reconciles one table with one [`EntityStorage`].
pub struct TableSynchronizer {
    entity_type: String,
    storage: Arc<dyn EntityStorage>,
    db: Arc<Database>,
    schema: Arc<SchemaInfo>,
    options: SynchronizerOptions,
}

impl TableSynchronizer {
    pub fn new(
        entity_type: &str,
        storage: Arc<dyn EntityStorage>,
        db: Arc<Database>,
        schema: Arc<SchemaInfo>,
    ) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            storage,
            db,
            schema,
            options: SynchronizerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SynchronizerOptions) -> Self {
        self.options = options;
        self
    }

    // -----------------------------------------------------------------------
    // Phase 1: targets
    // -----------------------------------------------------------------------

    /// Split the scope into records to upsert and mapped identifiers whose
    /// record is gone. Records that fail to load are reported and skipped.
    fn collect_targets(
        &self,
        scope: &SyncScope,
        mapped: &BTreeSet<VpId>,
        report: &mut SyncReport,
    ) -> Result<(Vec<EntityRecord>, Vec<VpId>), SyncError> {
        let candidates: Vec<VpId> = match scope {
            SyncScope::Everything => {
                let mut all: BTreeSet<VpId> = self.storage.ids()?.into_iter().collect();
                all.extend(mapped.iter().cloned());
                all.into_iter().collect()
            }
            SyncScope::Entities(list) => {
                let mut seen = BTreeSet::new();
                list.iter()
                    .filter(|a| seen.insert(a.vp_id.clone()))
                    .map(|a| a.vp_id.clone())
                    .collect()
            }
        };

        let mut present = Vec::new();
        let mut absent = Vec::new();
        for vp_id in candidates {
            match self.storage.load(&vp_id) {
                Ok(Some(record)) => present.push(record),
                Ok(None) if mapped.contains(&vp_id) => absent.push(vp_id),
                // Not stored and never mapped: another type's entity.
                Ok(None) => {}
                Err(e) => {
                    warn!(entity_type = %self.entity_type, %vp_id, error = %e, "failed to load record");
                    report.fail(&vp_id, e.into());
                }
            }
        }
        Ok((present, absent))
    }

    /// Order records so that a record referencing another record of the same
    /// type comes after it. Reference cycles are broken arbitrarily.
    fn parents_first(&self, entity: &EntityInfo, records: Vec<EntityRecord>) -> Vec<EntityRecord> {
        let self_fields: Vec<&str> = entity
            .fields_referencing(&entity.name)
            .map(|f| f.name.as_str())
            .collect();
        if self_fields.is_empty() || records.len() < 2 {
            return records;
        }

        let index: BTreeMap<String, usize> = records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.vp_id.to_string(), i))
            .collect();

        fn visit(
            i: usize,
            records: &[EntityRecord],
            self_fields: &[&str],
            index: &BTreeMap<String, usize>,
            visited: &mut [bool],
            order: &mut Vec<usize>,
        ) {
            if visited[i] {
                return;
            }
            visited[i] = true;
            for field in self_fields {
                if let Some(&parent) = records[i].reference(field).and_then(|p| index.get(p)) {
                    visit(parent, records, self_fields, index, visited, order);
                }
            }
            order.push(i);
        }

        let mut visited = vec![false; records.len()];
        let mut order = Vec::with_capacity(records.len());
        for i in 0..records.len() {
            visit(i, &records, &self_fields, &index, &mut visited, &mut order);
        }

        let mut slots: Vec<Option<EntityRecord>> = records.into_iter().map(Some).collect();
        order.into_iter().filter_map(|i| slots[i].take()).collect()
    }

    // -----------------------------------------------------------------------
    // Phase 2: upsert
    // -----------------------------------------------------------------------

    /// Column values for `record`: references translated to native keys,
    /// other values coerced to their declared kind, missing fields NULL.
    fn resolve_fields(
        &self,
        conn: &Connection,
        entity: &EntityInfo,
        record: &EntityRecord,
    ) -> Result<RowValues, SyncError> {
        for name in record.fields.keys() {
            if entity.field(name).is_none() {
                debug!(entity_type = %entity.name, vp_id = %record.vp_id, field = %name, "ignoring undeclared field");
            }
        }

        let mut values = RowValues::new();
        for field in &entity.fields {
            let raw = record.get(&field.name).cloned().unwrap_or(FieldValue::Null);
            let value = match &field.references {
                Some(target_type) => match raw {
                    FieldValue::Null => FieldValue::Null,
                    FieldValue::Text(ref s) if s.is_empty() => FieldValue::Null,
                    other => {
                        let target = other.to_string();
                        let unresolved = || SyncError::UnresolvedReference {
                            entity_type: entity.name.clone(),
                            vp_id: record.vp_id.to_string(),
                            field: field.name.clone(),
                            target_type: target_type.clone(),
                            target_vp_id: target.clone(),
                        };
                        let target_id = VpId::parse(&target).map_err(|_| unresolved())?;
                        let native = IdTranslator::get_native_key(conn, target_type, &target_id)?
                            .ok_or_else(unresolved)?;
                        FieldValue::Integer(native)
                    }
                },
                None => field.kind.coerce(raw),
            };
            values.insert(field.name.clone(), value);
        }
        Ok(values)
    }

    fn upsert(&self, entity: &EntityInfo, record: &EntityRecord) -> Result<EntityAction, SyncError> {
        self.db.transaction(|conn| {
            let values = self.resolve_fields(conn, entity, record)?;

            if let Some(native) = IdTranslator::get_native_key(conn, &entity.name, &record.vp_id)? {
                match queries::select_row(conn, entity, native)? {
                    Some(current) if current == values => return Ok(EntityAction::Unchanged),
                    Some(_) => {
                        queries::update_row(conn, entity, native, &values)?;
                        return Ok(EntityAction::Updated);
                    }
                    None => {
                        debug!(entity_type = %entity.name, vp_id = %record.vp_id, native, "mapped row is gone, re-inserting");
                    }
                }
            }

            let native = queries::insert_row(conn, entity, &values)?;
            IdTranslator::register_mapping(conn, &entity.name, &record.vp_id, native)?;
            Ok(EntityAction::Inserted)
        })
    }

    // -----------------------------------------------------------------------
    // Phase 3: delete
    // -----------------------------------------------------------------------

    fn remove(&self, entity: &EntityInfo, vp_id: &VpId) -> Result<EntityAction, SyncError> {
        self.db.transaction(|conn| {
            let removed = match IdTranslator::get_native_key(conn, &entity.name, vp_id)? {
                Some(native) => queries::delete_row(conn, entity, native)?,
                None => false,
            };
            IdTranslator::retire_mapping(conn, &entity.name, vp_id)?;
            Ok(if removed {
                EntityAction::Deleted
            } else {
                EntityAction::Unchanged
            })
        })
    }

    /// Delete rows that have no mapping at all. Returns how many were removed.
    fn sweep_orphans(&self, entity: &EntityInfo) -> Result<usize, SyncError> {
        self.db.transaction(|conn| {
            let mut removed = 0;
            for native in queries::list_native_ids(conn, entity)? {
                if IdTranslator::get_stable_id(conn, &entity.name, native)?.is_none()
                    && queries::delete_row(conn, entity, native)?
                {
                    debug!(entity_type = %entity.name, native, "deleted orphan row");
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }
}

impl Synchronizer for TableSynchronizer {
    fn entity_type(&self) -> &str {
        &self.entity_type
    }

    fn synchronize(&self, scope: &SyncScope) -> Result<SyncReport, SyncError> {
        let entity = self.schema.entity(&self.entity_type)?;
        let mut report = SyncReport::new(&self.entity_type);

        let mapped: BTreeSet<VpId> = {
            let conn = self.db.conn();
            IdTranslator::list_mappings(&conn, &entity.name)?
                .into_iter()
                .map(|m| m.vp_id)
                .collect()
        };

        let (present, absent) = self.collect_targets(scope, &mapped, &mut report)?;
        info!(
            entity_type = %entity.name,
            scope = %scope.label(),
            present = present.len(),
            absent = absent.len(),
            "synchronizing table"
        );

        for record in self.parents_first(entity, present) {
            match self.upsert(entity, &record) {
                Ok(action) => {
                    debug!(entity_type = %entity.name, vp_id = %record.vp_id, ?action, "upserted");
                    report.record(action);
                }
                Err(e) => {
                    warn!(entity_type = %entity.name, vp_id = %record.vp_id, error = %e, "failed to synchronize entity");
                    report.fail(&record.vp_id, e);
                }
            }
        }

        for vp_id in absent {
            match self.remove(entity, &vp_id) {
                Ok(action) => {
                    debug!(entity_type = %entity.name, %vp_id, ?action, "removed");
                    report.record(action);
                }
                Err(e) => {
                    warn!(entity_type = %entity.name, %vp_id, error = %e, "failed to delete entity");
                    report.fail(&vp_id, e);
                }
            }
        }

        if matches!(scope, SyncScope::Everything) && self.options.delete_orphan_rows {
            report.deleted += self.sweep_orphans(entity)?;
        }

        info!(
            entity_type = %entity.name,
            inserted = report.inserted,
            updated = report.updated,
            deleted = report.deleted,
            unchanged = report.unchanged,
            failed = report.failures.len(),
            "table synchronized"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EntityConfig, FieldConfig};
    use crate::models::AffectedEntity;
    use crate::schema::FieldKind;
    use crate::storage::DirectoryStorage;

    fn page_schema() -> Arc<SchemaInfo> {
        let mut fields = BTreeMap::new();
        fields.insert("title".to_string(), FieldConfig::default());
        fields.insert(
            "parent".to_string(),
            FieldConfig {
                kind: FieldKind::Integer,
                references: Some("page".into()),
            },
        );
        fields.insert(
            "weight".to_string(),
            FieldConfig {
                kind: FieldKind::Integer,
                references: None,
            },
        );
        let mut entities = BTreeMap::new();
        entities.insert(
            "page".to_string(),
            EntityConfig {
                table: "pages".into(),
                id_column: "id".into(),
                fields,
            },
        );
        Arc::new(SchemaInfo::from_config(&entities).unwrap())
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<Database>,
        storage: Arc<DirectoryStorage>,
        sync: TableSynchronizer,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let schema = page_schema();
        let db = Arc::new(Database::in_memory().unwrap());
        db.initialize().unwrap();
        db.ensure_entity_tables(&schema).unwrap();
        let storage = Arc::new(DirectoryStorage::new("page", dir.path().join("page")));
        let sync = TableSynchronizer::new("page", storage.clone(), db.clone(), schema);
        Fixture {
            _dir: dir,
            db,
            storage,
            sync,
        }
    }

    fn id(s: &str) -> VpId {
        VpId::parse(s).unwrap()
    }

    fn native(db: &Database, vp_id: &str) -> Option<i64> {
        let conn = db.conn();
        IdTranslator::get_native_key(&conn, "page", &id(vp_id)).unwrap()
    }

    #[test]
    fn test_children_before_parents_in_storage_order() {
        let f = fixture();
        // "A" sorts before "Z" but references it.
        f.storage
            .save(&EntityRecord::new(id("A")).with_field("title", "child").with_field("parent", "Z"))
            .unwrap();
        f.storage
            .save(&EntityRecord::new(id("Z")).with_field("title", "root"))
            .unwrap();

        let report = f.sync.synchronize(&SyncScope::Everything).unwrap();
        assert!(report.is_success(), "{:?}", report.failures);
        assert_eq!(report.inserted, 2);

        let child = native(&f.db, "A").unwrap();
        let root = native(&f.db, "Z").unwrap();
        let schema = page_schema();
        let entity = schema.entity("page").unwrap();
        let row = queries::select_row(&f.db.conn(), entity, child).unwrap().unwrap();
        assert_eq!(row["parent"], FieldValue::Integer(root));
    }

    #[test]
    fn test_self_reference_cycle_is_unresolved() {
        let f = fixture();
        f.storage
            .save(&EntityRecord::new(id("A")).with_field("parent", "B"))
            .unwrap();
        f.storage
            .save(&EntityRecord::new(id("B")).with_field("parent", "A"))
            .unwrap();

        let report = f.sync.synchronize(&SyncScope::Everything).unwrap();
        assert_eq!(report.inserted, 0);
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures.iter().all(|f| f.error.is_unresolved_reference()));
    }

    #[test]
    fn test_coercion_keeps_second_pass_clean() {
        let f = fixture();
        f.storage
            .save(
                &EntityRecord::new(id("A"))
                    .with_field("title", 42)
                    .with_field("weight", "7"),
            )
            .unwrap();

        let first = f.sync.synchronize(&SyncScope::Everything).unwrap();
        assert_eq!(first.inserted, 1);
        let second = f.sync.synchronize(&SyncScope::Everything).unwrap();
        assert_eq!(second.writes(), 0);
        assert_eq!(second.unchanged, 1);
    }

    #[test]
    fn test_selective_ignores_foreign_identifiers() {
        let f = fixture();
        f.storage.save(&EntityRecord::new(id("A"))).unwrap();

        let scope = SyncScope::Entities(vec![
            AffectedEntity::changed(id("A")),
            AffectedEntity::changed(id("A")),
            AffectedEntity::changed(id("SOMEONE_ELSE")),
        ]);
        let report = f.sync.synchronize(&scope).unwrap();
        assert!(report.is_success());
        assert_eq!(report.inserted, 1);
        assert_eq!(report.unchanged, 0);
    }

    #[test]
    fn test_orphan_sweep_respects_option() {
        let f = fixture();
        f.db.conn()
            .execute("INSERT INTO pages (title) VALUES ('stray')", [])
            .unwrap();

        let keep = TableSynchronizer::new(
            "page",
            f.storage.clone(),
            f.db.clone(),
            page_schema(),
        )
        .with_options(SynchronizerOptions {
            delete_orphan_rows: false,
        });
        assert_eq!(keep.synchronize(&SyncScope::Everything).unwrap().deleted, 0);

        let report = f.sync.synchronize(&SyncScope::Everything).unwrap();
        assert_eq!(report.deleted, 1);
    }
}
