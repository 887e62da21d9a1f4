//! Per-entity-type synchronizers.
//!
//! A [`Synchronizer`] reconciles one table with the stored records of its
//! entity type. The [`SynchronizerRegistry`] holds one synchronizer per type
//! declared by the schema and is populated once at startup.

pub mod table;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::config::SyncConfig;
use crate::db::Database;
use crate::errors::{SchemaError, SyncError};
use crate::models::{SyncScope, VpId};
use crate::schema::SchemaInfo;
use crate::storage::StorageFactory;

pub use table::TableSynchronizer;

/// Reconciles one entity type's table with its stored records.
pub trait Synchronizer: Send + Sync {
    fn entity_type(&self) -> &str;

    /// Run one pass over `scope`. Per-entity problems are collected into the
    /// report; an `Err` means the pass itself could not run.
    fn synchronize(&self, scope: &SyncScope) -> Result<SyncReport, SyncError>;
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// A single entity that could not be synchronized.
#[derive(Debug)]
pub struct EntityFailure {
    pub entity_type: String,
    pub vp_id: VpId,
    pub error: SyncError,
}

impl std::fmt::Display for EntityFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.entity_type, self.vp_id, self.error)
    }
}

/// Outcome of one synchronizer pass.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub entity_type: String,
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub failures: Vec<EntityFailure>,
}

/// What happened to one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityAction {
    Inserted,
    Updated,
    Deleted,
    Unchanged,
}

impl SyncReport {
    pub fn new(entity_type: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            ..Default::default()
        }
    }

    pub fn record(&mut self, action: EntityAction) {
        match action {
            EntityAction::Inserted => self.inserted += 1,
            EntityAction::Updated => self.updated += 1,
            EntityAction::Deleted => self.deleted += 1,
            EntityAction::Unchanged => self.unchanged += 1,
        }
    }

    pub fn fail(&mut self, vp_id: &VpId, error: SyncError) {
        self.failures.push(EntityFailure {
            entity_type: self.entity_type.clone(),
            vp_id: vp_id.clone(),
            error,
        });
    }

    /// Row writes performed (inserts + updates + deletes).
    pub fn writes(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Behaviour switches shared by all synchronizers.
#[derive(Debug, Clone, Copy)]
pub struct SynchronizerOptions {
    /// Delete rows without any mapping during a full pass.
    pub delete_orphan_rows: bool,
}

impl Default for SynchronizerOptions {
    fn default() -> Self {
        Self {
            delete_orphan_rows: true,
        }
    }
}

impl From<&SyncConfig> for SynchronizerOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            delete_orphan_rows: config.delete_orphan_rows,
        }
    }
}

/// Synchronizers keyed by entity type.
#[derive(Default)]
pub struct SynchronizerRegistry {
    synchronizers: BTreeMap<String, Box<dyn Synchronizer>>,
}

impl SynchronizerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One [`TableSynchronizer`] per entity type of `schema`.
    pub fn from_schema(
        schema: Arc<SchemaInfo>,
        storages: &StorageFactory,
        db: Arc<Database>,
        options: SynchronizerOptions,
    ) -> Result<Self, SchemaError> {
        let mut registry = Self::new();
        for entity in schema.entities() {
            let storage = storages.get_storage(&entity.name)?;
            registry.register(Box::new(
                TableSynchronizer::new(&entity.name, storage, db.clone(), schema.clone())
                    .with_options(options),
            ));
        }
        debug!(count = registry.synchronizers.len(), "synchronizer registry populated");
        Ok(registry)
    }

    /// Add or replace the synchronizer of its entity type.
    pub fn register(&mut self, synchronizer: Box<dyn Synchronizer>) {
        self.synchronizers
            .insert(synchronizer.entity_type().to_string(), synchronizer);
    }

    pub fn get(&self, entity_type: &str) -> Result<&dyn Synchronizer, SchemaError> {
        self.synchronizers
            .get(entity_type)
            .map(|s| s.as_ref())
            .ok_or_else(|| SchemaError::UnknownEntity(entity_type.to_string()))
    }

    pub fn len(&self) -> usize {
        self.synchronizers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.synchronizers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_counts() {
        let mut report = SyncReport::new("post");
        report.record(EntityAction::Inserted);
        report.record(EntityAction::Updated);
        report.record(EntityAction::Unchanged);
        report.record(EntityAction::Deleted);
        assert_eq!(report.writes(), 3);
        assert!(report.is_success());

        let id = VpId::parse("P9").unwrap();
        report.fail(
            &id,
            SyncError::SchemaError(SchemaError::UnknownEntity("x".into())),
        );
        assert!(!report.is_success());
        assert_eq!(report.failures[0].entity_type, "post");
        assert!(report.failures[0].to_string().starts_with("post P9: "));
    }

    #[test]
    fn test_options_from_config() {
        let config = SyncConfig {
            delete_orphan_rows: false,
            ..Default::default()
        };
        assert!(!SynchronizerOptions::from(&config).delete_orphan_rows);
    }

    #[test]
    fn test_registry_unknown_type() {
        let registry = SynchronizerRegistry::new();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.get("post"),
            Err(SchemaError::UnknownEntity(_))
        ));
    }
}
