//! Synchronization orchestrator.
//!
//! The [`SyncEngine`] drives one run at a time:
//!
//! 1. Take the run lock and record the run in `sync_runs`.
//! 2. For a selective run, expand the affected set along the reference
//!    graph: missing dependencies first, then dependents up to the
//!    configured depth.
//! 3. Dispatch to each entity type's synchronizer in dependency order.
//! 4. Record counts, failures and the final state.
//!
//! A lock mechanism prevents concurrent runs, so a table is never written by
//! two synchronizers at once.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capture::{Capture, CaptureReport};
use crate::config::{AppConfig, SyncConfig};
use crate::db::queries::{self, RunCounts, SyncRunEntry};
use crate::db::Database;
use crate::errors::{CoreError, SyncError};
use crate::models::{AffectedEntity, EntityRecord, SyncScope, VpId};
use crate::schema::SchemaInfo;
use crate::storage::StorageFactory;
use crate::synchronizer::{EntityFailure, SyncReport, SynchronizerOptions, SynchronizerRegistry};
use crate::translator::IdTranslator;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Result of one run: a report per entity type, in dependency order.
#[derive(Debug)]
pub struct SyncOutcome {
    pub run_id: String,
    pub scope: SyncScope,
    pub reports: Vec<SyncReport>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        self.reports.iter().all(SyncReport::is_success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &EntityFailure> {
        self.reports.iter().flat_map(|r| r.failures.iter())
    }

    /// Row writes across all entity types.
    pub fn total_writes(&self) -> usize {
        self.reports.iter().map(SyncReport::writes).sum()
    }

    pub fn report(&self, entity_type: &str) -> Option<&SyncReport> {
        self.reports.iter().find(|r| r.entity_type == entity_type)
    }

    pub fn counts(&self) -> RunCounts {
        total_counts(&self.reports)
    }
}

fn total_counts(reports: &[SyncReport]) -> RunCounts {
    reports.iter().fold(RunCounts::default(), |mut c, r| {
        c.inserted += r.inserted;
        c.updated += r.updated;
        c.deleted += r.deleted;
        c.unchanged += r.unchanged;
        c.failed += r.failures.len();
        c
    })
}

/// Per-type state of the mirror and the table.
#[derive(Debug, Clone, Serialize)]
pub struct EntityStatus {
    pub entity_type: String,
    pub table: String,
    pub stored: usize,
    pub mapped: i64,
    pub rows: i64,
}

/// Snapshot returned by [`SyncEngine::status`].
#[derive(Debug, Clone)]
pub struct MirrorStatus {
    pub entities: Vec<EntityStatus>,
    pub last_sync_at: Option<String>,
    pub last_sync_state: Option<String>,
    pub last_run: Option<SyncRunEntry>,
}

/// Where a stable identifier currently stands.
#[derive(Debug, Clone)]
pub struct LookupResult {
    pub entity_type: String,
    pub vp_id: VpId,
    pub native_id: Option<i64>,
    pub retired: bool,
    pub record: Option<EntityRecord>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

const STATE_LAST_SYNC_AT: &str = "last_sync_at";
const STATE_LAST_SYNC_STATE: &str = "last_sync_state";

/// The synchronization orchestrator.
pub struct SyncEngine {
    schema: Arc<SchemaInfo>,
    db: Arc<Database>,
    storages: StorageFactory,
    registry: SynchronizerRegistry,
    config: SyncConfig,
    /// Atomic flag preventing concurrent runs.
    running: Arc<AtomicBool>,
    run_started_at: Mutex<Option<String>>,
}

impl SyncEngine {
    /// Create an engine with one table synchronizer per declared type.
    pub fn new(
        schema: Arc<SchemaInfo>,
        db: Arc<Database>,
        storages: StorageFactory,
        config: SyncConfig,
    ) -> Result<Self, CoreError> {
        let registry = SynchronizerRegistry::from_schema(
            schema.clone(),
            &storages,
            db.clone(),
            SynchronizerOptions::from(&config),
        )?;
        Ok(Self::with_registry(schema, db, storages, registry, config))
    }

    /// Create an engine around an already populated registry.
    pub fn with_registry(
        schema: Arc<SchemaInfo>,
        db: Arc<Database>,
        storages: StorageFactory,
        registry: SynchronizerRegistry,
        config: SyncConfig,
    ) -> Self {
        info!(
            entity_types = registry.len(),
            order = ?schema.dependency_order(),
            "initializing sync engine"
        );
        Self {
            schema,
            db,
            storages,
            registry,
            config,
            running: Arc::new(AtomicBool::new(false)),
            run_started_at: Mutex::new(None),
        }
    }

    /// Open the database and mirror named by `config`.
    pub fn from_config(config: &AppConfig) -> Result<Self, CoreError> {
        let schema = Arc::new(config.schema()?);
        let db = Arc::new(Database::new(&config.mirror.database_path)?);
        db.initialize()?;
        if config.sync.create_missing_tables {
            db.ensure_entity_tables(&schema)?;
        }
        let storages = StorageFactory::new(&config.mirror.mirror_dir, &schema);
        Self::new(schema, db, storages, config.sync.clone())
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn schema(&self) -> &SchemaInfo {
        &self.schema
    }

    pub fn storages(&self) -> &StorageFactory {
        &self.storages
    }

    /// Check if a run is currently in progress.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Main entry points
    // -----------------------------------------------------------------------

    /// Full pass over every entity type.
    pub fn synchronize_all(&self) -> Result<SyncOutcome, SyncError> {
        self.run(&SyncScope::Everything)
    }

    /// Selective pass over `affected` and whatever it pulls in.
    pub fn synchronize_entities(
        &self,
        affected: Vec<AffectedEntity>,
    ) -> Result<SyncOutcome, SyncError> {
        self.run(&SyncScope::Entities(affected))
    }

    /// Execute one run.
    ///
    /// Per-entity failures are collected in the outcome and the run still
    /// returns `Ok`. An `Err` means a whole pass could not run. The run lock
    /// is released via a drop guard so it is freed even if the run panics.
    pub fn run(&self, scope: &SyncScope) -> Result<SyncOutcome, SyncError> {
        let _guard = self.acquire()?;

        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        self.set_run_started(Some(started_at.to_rfc3339()));

        info!(run_id = %run_id, scope = %scope.label(), "starting sync run");
        if let Err(e) = self.db.start_sync_run(&run_id, &scope.label()) {
            warn!(run_id = %run_id, error = %e, "failed to record sync run start");
        }
        self.set_state(STATE_LAST_SYNC_STATE, "running");

        let mut reports = Vec::with_capacity(self.schema.dependency_order().len());
        let result = match self.do_run(scope, &mut reports) {
            Ok(scope) => Ok(SyncOutcome {
                run_id: run_id.clone(),
                scope,
                reports,
                started_at,
                completed_at: Utc::now(),
            }),
            Err(e) => Err((e, total_counts(&reports))),
        };

        let (status, counts, details) = match &result {
            Ok(outcome) => {
                let failures: Vec<serde_json::Value> = outcome
                    .failures()
                    .map(|f| {
                        serde_json::json!({
                            "entity_type": f.entity_type,
                            "vp_id": f.vp_id.as_str(),
                            "error": f.error.to_string(),
                        })
                    })
                    .collect();
                let status = if outcome.is_success() { "success" } else { "partial" };
                let details = (!failures.is_empty())
                    .then(|| serde_json::Value::Array(failures).to_string());
                (status, outcome.counts(), details)
            }
            // Types that finished before the failure have committed their writes.
            Err((e, partial)) => ("error", *partial, Some(e.to_string())),
        };

        if let Err(e) = self
            .db
            .complete_sync_run(&run_id, status, &counts, details.as_deref())
        {
            warn!(run_id = %run_id, error = %e, "failed to record sync run completion");
        }
        self.set_state(STATE_LAST_SYNC_STATE, status);
        self.set_state(STATE_LAST_SYNC_AT, &Utc::now().to_rfc3339());
        self.set_run_started(None);

        match &result {
            Ok(outcome) => info!(
                run_id = %run_id,
                status,
                writes = outcome.total_writes(),
                failed = counts.failed,
                "sync run complete"
            ),
            Err((e, _)) => warn!(run_id = %run_id, error = %e, "sync run failed"),
        }

        // Lock is released by _guard drop (happens here at scope end).
        result.map_err(|(e, _)| e)
    }

    /// Export the database into the mirror. Holds the run lock.
    pub fn capture_all(&self) -> Result<CaptureReport, CoreError> {
        let _guard = self.acquire()?;
        self.set_run_started(Some(Utc::now().to_rfc3339()));
        let result = Capture::capture_all(&self.schema, &self.db, &self.storages);
        self.set_run_started(None);
        result
    }

    // -----------------------------------------------------------------------
    // Inner run logic
    // -----------------------------------------------------------------------

    /// Reports of the types that completed are pushed to `reports` as they
    /// finish, so they survive a later type's failure.
    fn do_run(
        &self,
        scope: &SyncScope,
        reports: &mut Vec<SyncReport>,
    ) -> Result<SyncScope, SyncError> {
        let scope = match scope {
            SyncScope::Everything => SyncScope::Everything,
            SyncScope::Entities(affected) => {
                let expanded = self.expand_affected(affected)?;
                info!(
                    requested = affected.len(),
                    expanded = expanded.len(),
                    "expanded affected entities"
                );
                SyncScope::Entities(expanded)
            }
        };

        for entity_type in self.schema.dependency_order() {
            let synchronizer = self.registry.get(entity_type)?;
            reports.push(synchronizer.synchronize(&scope)?);
        }
        Ok(scope)
    }

    /// Grow `affected` along the reference graph.
    ///
    /// Referenced entities that have no native key yet are always added,
    /// transitively. Entities whose stored record or current row references
    /// an affected entity are added up to `propagation_depth` hops away.
    /// Each addition records the entity that pulled it in as its parent.
    pub fn expand_affected(
        &self,
        affected: &[AffectedEntity],
    ) -> Result<Vec<AffectedEntity>, SyncError> {
        let mut ctx = Expansion::new(self);
        let mut frontier = Vec::new();
        for entity in affected {
            if ctx.add(entity.clone()) {
                frontier.push(entity.vp_id.clone());
            }
        }
        ctx.add_missing_dependencies(0)?;

        for hop in 0..self.config.propagation_depth {
            let mut next = Vec::new();
            for vp_id in &frontier {
                for dependent in ctx.dependents_of(vp_id)? {
                    let id = dependent.vp_id.clone();
                    if ctx.add(dependent) {
                        next.push(id);
                    }
                }
            }
            debug!(hop = hop + 1, added = next.len(), "dependent propagation");
            if next.is_empty() {
                break;
            }
            let start = ctx.result.len() - next.len();
            ctx.add_missing_dependencies(start)?;
            frontier = next;
        }

        Ok(ctx.result)
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Per-type counts plus the last recorded run.
    pub fn status(&self) -> Result<MirrorStatus, CoreError> {
        let mut entities = Vec::new();
        for name in self.schema.dependency_order() {
            let entity = self.schema.entity(name)?;
            let stored = self.storages.get_storage(name)?.ids()?.len();
            let (mapped, rows) = {
                let conn = self.db.conn();
                (
                    IdTranslator::count_mappings(&conn, name)?,
                    queries::count_rows(&conn, entity)?,
                )
            };
            entities.push(EntityStatus {
                entity_type: name.clone(),
                table: entity.table.clone(),
                stored,
                mapped,
                rows,
            });
        }

        let last_run = self.db.list_sync_runs(1)?.into_iter().next();
        Ok(MirrorStatus {
            entities,
            last_sync_at: self.db.get_state(STATE_LAST_SYNC_AT)?,
            last_sync_state: self.db.get_state(STATE_LAST_SYNC_STATE)?,
            last_run,
        })
    }

    /// Resolve a stable identifier of `entity_type`.
    pub fn lookup(&self, entity_type: &str, vp_id: &VpId) -> Result<LookupResult, CoreError> {
        self.schema.entity(entity_type)?;
        let record = self.storages.get_storage(entity_type)?.load(vp_id)?;
        let (native_id, retired) = {
            let conn = self.db.conn();
            (
                IdTranslator::get_native_key(&conn, entity_type, vp_id)?,
                IdTranslator::is_retired(&conn, entity_type, vp_id)?,
            )
        };
        Ok(LookupResult {
            entity_type: entity_type.to_string(),
            vp_id: vp_id.clone(),
            native_id,
            retired,
            record,
        })
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn acquire(&self) -> Result<SyncLockGuard, SyncError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::AlreadyRunning {
                started_at: self.run_started().unwrap_or_else(|| "unknown".into()),
            });
        }
        // RAII guard that clears the running flag on drop (even on panic).
        Ok(SyncLockGuard(self.running.clone()))
    }

    fn run_started(&self) -> Option<String> {
        self.run_started_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_run_started(&self, value: Option<String>) {
        *self
            .run_started_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = value;
    }

    fn set_state(&self, key: &str, value: &str) {
        if let Err(e) = self.db.set_state(key, value) {
            warn!(key, error = %e, "failed to update sync state");
        }
    }
}

/// Drop guard that resets the `running` flag to `false`.
///
/// This ensures the run lock is always released, even if a run panics.
struct SyncLockGuard(Arc<AtomicBool>);

impl Drop for SyncLockGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Affected-set expansion
// ---------------------------------------------------------------------------

/// Working state of [`SyncEngine::expand_affected`]. Stored records are
/// loaded lazily and cached per type; unreadable records are skipped here
/// and reported by their synchronizer.
struct Expansion<'a> {
    engine: &'a SyncEngine,
    result: Vec<AffectedEntity>,
    seen: BTreeSet<VpId>,
    types: BTreeMap<VpId, Option<String>>,
    stored: BTreeMap<String, Vec<EntityRecord>>,
}

impl<'a> Expansion<'a> {
    fn new(engine: &'a SyncEngine) -> Self {
        Self {
            engine,
            result: Vec::new(),
            seen: BTreeSet::new(),
            types: BTreeMap::new(),
            stored: BTreeMap::new(),
        }
    }

    fn add(&mut self, entity: AffectedEntity) -> bool {
        if !self.seen.insert(entity.vp_id.clone()) {
            return false;
        }
        self.result.push(entity);
        true
    }

    /// Entity type of `vp_id`: the storage holding it, else the mapping.
    fn type_of(&mut self, vp_id: &VpId) -> Result<Option<String>, SyncError> {
        if let Some(t) = self.types.get(vp_id) {
            return Ok(t.clone());
        }
        let engine = self.engine;
        let found = match engine.storages.find_entity_type(vp_id)? {
            Some(t) => Some(t),
            None => {
                let conn = engine.db.conn();
                IdTranslator::find_entity_type(&conn, vp_id)?
            }
        };
        if found.is_none() {
            debug!(%vp_id, "affected entity is unknown to every type");
        }
        self.types.insert(vp_id.clone(), found.clone());
        Ok(found)
    }

    fn stored_records(&mut self, entity_type: &str) -> Result<&[EntityRecord], SyncError> {
        if !self.stored.contains_key(entity_type) {
            let storage = self.engine.storages.get_storage(entity_type)?;
            let mut records = Vec::new();
            for vp_id in storage.ids()? {
                match storage.load(&vp_id) {
                    Ok(Some(record)) => records.push(record),
                    Ok(None) => {}
                    Err(e) => debug!(entity_type, %vp_id, error = %e, "skipping unreadable record"),
                }
            }
            self.stored.insert(entity_type.to_string(), records);
        }
        Ok(self
            .stored
            .get(entity_type)
            .map(Vec::as_slice)
            .unwrap_or_default())
    }

    /// Add, transitively, the unmapped entities referenced by
    /// `result[start..]`.
    fn add_missing_dependencies(&mut self, start: usize) -> Result<(), SyncError> {
        let engine = self.engine;
        let mut queue: VecDeque<VpId> = self.result[start..].iter().map(|a| a.vp_id.clone()).collect();
        while let Some(vp_id) = queue.pop_front() {
            let Some(entity_type) = self.type_of(&vp_id)? else {
                continue;
            };
            let entity = engine.schema.entity(&entity_type)?;
            let storage = engine.storages.get_storage(&entity_type)?;
            let Ok(Some(record)) = storage.load(&vp_id) else {
                continue;
            };

            for field in entity.reference_fields() {
                let (Some(target_type), Some(target)) =
                    (field.references.as_deref(), record.reference(&field.name))
                else {
                    continue;
                };
                let Ok(target_id) = VpId::parse(target) else {
                    continue;
                };
                if self.seen.contains(&target_id) {
                    continue;
                }
                let mapped = {
                    let conn = engine.db.conn();
                    IdTranslator::get_native_key(&conn, target_type, &target_id)?.is_some()
                };
                let target_storage = engine.storages.get_storage(target_type)?;
                if mapped || !target_storage.exists(&target_id)? {
                    continue;
                }
                debug!(%vp_id, field = %field.name, target = %target_id, "pulling in missing dependency");
                self.types.insert(target_id.clone(), Some(target_type.to_string()));
                self.add(AffectedEntity::via(target_id.clone(), vp_id.clone()));
                queue.push_back(target_id);
            }
        }
        Ok(())
    }

    /// Entities whose stored record or current row references `vp_id`.
    fn dependents_of(&mut self, vp_id: &VpId) -> Result<Vec<AffectedEntity>, SyncError> {
        let Some(entity_type) = self.type_of(vp_id)? else {
            return Ok(Vec::new());
        };
        let engine = self.engine;
        let native = {
            let conn = engine.db.conn();
            IdTranslator::get_native_key(&conn, &entity_type, vp_id)?
        };

        let mut found = BTreeSet::new();
        for (dependent, field) in engine.schema.dependents_of(&entity_type) {
            for record in self.stored_records(&dependent.name)? {
                if record.reference(&field.name) == Some(vp_id.as_str()) {
                    found.insert((dependent.name.clone(), record.vp_id.clone()));
                }
            }

            if let Some(native) = native {
                let conn = engine.db.conn();
                for row in queries::native_ids_referencing(&conn, dependent, &field.name, native)? {
                    if let Some(id) = IdTranslator::get_stable_id(&conn, &dependent.name, row)? {
                        found.insert((dependent.name.clone(), id));
                    }
                }
            }
        }

        Ok(found
            .into_iter()
            .filter(|(_, id)| id != vp_id)
            .map(|(t, id)| {
                self.types.insert(id.clone(), Some(t));
                AffectedEntity::via(id, vp_id.clone())
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_guard_releases_flag() {
        let flag = Arc::new(AtomicBool::new(true));
        {
            let _guard = SyncLockGuard(flag.clone());
        }
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_outcome_aggregates_reports() {
        let mut user = SyncReport::new("user");
        user.inserted = 2;
        user.unchanged = 1;
        let mut post = SyncReport::new("post");
        post.updated = 1;
        post.deleted = 1;

        let outcome = SyncOutcome {
            run_id: "r".into(),
            scope: SyncScope::Everything,
            reports: vec![user, post],
            started_at: Utc::now(),
            completed_at: Utc::now(),
        };
        assert!(outcome.is_success());
        assert_eq!(outcome.total_writes(), 4);
        assert_eq!(outcome.failures().count(), 0);
        assert_eq!(outcome.report("post").map(|r| r.updated), Some(1));
        let counts = outcome.counts();
        assert_eq!(counts.inserted, 2);
        assert_eq!(counts.unchanged, 1);
    }
}
