//! File mirror of entity records.
//!
//! Each entity type has its own [`EntityStorage`]; the [`StorageFactory`]
//! hands out the storage for a type by name. Storage only knows about
//! records and stable identifiers and never touches the database.

pub mod directory;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::errors::{SchemaError, StorageError};
use crate::models::{EntityRecord, VpId};
use crate::schema::SchemaInfo;

pub use directory::DirectoryStorage;

/// Persistent set of records of one entity type, keyed by stable identifier.
pub trait EntityStorage: Send + Sync {
    /// Entity type this storage holds.
    fn entity_type(&self) -> &str;

    /// Persist a record, replacing any previous version. Returns `false`
    /// when the stored content was already identical and nothing was written.
    fn save(&self, record: &EntityRecord) -> Result<bool, StorageError>;

    /// Remove a record. Returns whether a record existed.
    fn delete(&self, vp_id: &VpId) -> Result<bool, StorageError>;

    /// Load one record, `None` if it is not stored.
    fn load(&self, vp_id: &VpId) -> Result<Option<EntityRecord>, StorageError>;

    /// Identifiers of every stored record, sorted.
    fn ids(&self) -> Result<Vec<VpId>, StorageError>;

    /// Load every stored record, sorted by identifier.
    fn load_all(&self) -> Result<Vec<EntityRecord>, StorageError> {
        let mut records = Vec::new();
        for vp_id in self.ids()? {
            if let Some(record) = self.load(&vp_id)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Load one record, failing with [`StorageError::RecordNotFound`] if it
    /// is not stored.
    fn get(&self, vp_id: &VpId) -> Result<EntityRecord, StorageError> {
        self.load(vp_id)?.ok_or_else(|| StorageError::RecordNotFound {
            entity_type: self.entity_type().to_string(),
            vp_id: vp_id.to_string(),
        })
    }

    fn exists(&self, vp_id: &VpId) -> Result<bool, StorageError> {
        Ok(self.load(vp_id)?.is_some())
    }
}

/// One storage per declared entity type, rooted at the mirror directory.
#[derive(Clone)]
pub struct StorageFactory {
    root: PathBuf,
    storages: BTreeMap<String, Arc<dyn EntityStorage>>,
}

impl StorageFactory {
    /// Build a [`DirectoryStorage`] under `root` for every type in `schema`.
    pub fn new<P: AsRef<Path>>(root: P, schema: &SchemaInfo) -> Self {
        let root = root.as_ref().to_path_buf();
        let storages = schema
            .entities()
            .map(|e| {
                let storage: Arc<dyn EntityStorage> =
                    Arc::new(DirectoryStorage::new(&e.name, root.join(&e.name)));
                (e.name.clone(), storage)
            })
            .collect::<BTreeMap<_, _>>();
        debug!(root = %root.display(), types = storages.len(), "storage factory ready");
        Self { root, storages }
    }

    /// Replace the storage of one entity type.
    pub fn with_storage(mut self, storage: Arc<dyn EntityStorage>) -> Self {
        self.storages
            .insert(storage.entity_type().to_string(), storage);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Storage of `entity_type`.
    pub fn get_storage(&self, entity_type: &str) -> Result<Arc<dyn EntityStorage>, SchemaError> {
        self.storages
            .get(entity_type)
            .cloned()
            .ok_or_else(|| SchemaError::UnknownEntity(entity_type.to_string()))
    }

    /// The entity type whose storage holds `vp_id`, if any.
    pub fn find_entity_type(&self, vp_id: &VpId) -> Result<Option<String>, StorageError> {
        for (name, storage) in &self.storages {
            if storage.exists(vp_id)? {
                return Ok(Some(name.clone()));
            }
        }
        Ok(None)
    }
}
