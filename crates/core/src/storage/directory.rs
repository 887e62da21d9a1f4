//! Directory-backed record storage.
//!
//! One directory per entity type, one TOML file per record:
//!
//! ```toml
//! vp_id = "3F2A9C0E51B84D7A9E06C1D2B3A4F5E6"
//! comment_content = "Nice post"
//! comment_post_ID = "9D1C2B3A4F5E60718293A4B5C6D7E8F9"
//! ```
//!
//! `vp_id` comes first, the remaining fields follow sorted by name, and NULL
//! fields are left out.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use super::EntityStorage;
use crate::errors::StorageError;
use crate::models::{EntityRecord, FieldValue, VpId};
use crate::schema::VP_ID_FIELD;

const RECORD_EXTENSION: &str = "toml";

/// On-disk shape of a record.
#[derive(Serialize)]
struct RecordFile<'a> {
    vp_id: &'a str,
    #[serde(flatten)]
    fields: BTreeMap<&'a str, &'a FieldValue>,
}

/// Record storage under a single directory.
pub struct DirectoryStorage {
    entity_type: String,
    dir: PathBuf,
}

impl DirectoryStorage {
    pub fn new<P: Into<PathBuf>>(entity_type: &str, dir: P) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            dir: dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file holding `vp_id`.
    pub fn record_path(&self, vp_id: &VpId) -> PathBuf {
        self.dir
            .join(format!("{}.{}", vp_id.as_str(), RECORD_EXTENSION))
    }

    fn render(&self, record: &EntityRecord) -> Result<String, StorageError> {
        let file = RecordFile {
            vp_id: record.vp_id.as_str(),
            fields: record
                .fields
                .iter()
                .filter(|(name, value)| !value.is_null() && name.as_str() != VP_ID_FIELD)
                .map(|(name, value)| (name.as_str(), value))
                .collect(),
        };
        toml::to_string(&file).map_err(|e| StorageError::Serialize {
            entity_type: self.entity_type.clone(),
            vp_id: record.vp_id.to_string(),
            detail: e.to_string(),
        })
    }

    fn parse(&self, path: &Path, contents: &str, expected: &VpId) -> Result<EntityRecord, StorageError> {
        let parse_err = |detail: String| StorageError::Parse {
            path: path.display().to_string(),
            detail,
        };

        let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| parse_err(e.to_string()))?;

        let vp_id = match table.get(VP_ID_FIELD) {
            Some(toml::Value::String(s)) => VpId::parse(s).map_err(|e| parse_err(e.to_string()))?,
            Some(_) => return Err(parse_err("vp_id must be a string".into())),
            None => return Err(parse_err("missing vp_id".into())),
        };
        if &vp_id != expected {
            return Err(parse_err(format!(
                "vp_id {} does not match file name {}",
                vp_id, expected
            )));
        }

        let mut record = EntityRecord::new(vp_id);
        for (name, value) in table {
            if name == VP_ID_FIELD {
                continue;
            }
            let value = match value {
                toml::Value::String(s) => FieldValue::Text(s),
                toml::Value::Integer(i) => FieldValue::Integer(i),
                toml::Value::Float(f) => FieldValue::Real(f),
                toml::Value::Boolean(b) => FieldValue::Integer(i64::from(b)),
                other => {
                    return Err(parse_err(format!(
                        "field '{}' has unsupported type {}",
                        name,
                        other.type_str()
                    )))
                }
            };
            record.fields.insert(name, value);
        }
        Ok(record)
    }

    /// Write `contents` to `path` through a temp file in the same directory.
    fn write_atomic(&self, path: &Path, contents: &str) -> Result<(), StorageError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| StorageError::io(&self.dir, e))?;
        let mut tmp =
            tempfile::NamedTempFile::new_in(&self.dir).map_err(|e| StorageError::io(&self.dir, e))?;
        tmp.write_all(contents.as_bytes())
            .map_err(|e| StorageError::io(tmp.path(), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| StorageError::io(tmp.path(), e))?;
        tmp.persist(path)
            .map_err(|e| StorageError::io(path, e.error))?;
        Ok(())
    }
}

impl EntityStorage for DirectoryStorage {
    fn entity_type(&self) -> &str {
        &self.entity_type
    }

    fn save(&self, record: &EntityRecord) -> Result<bool, StorageError> {
        let path = self.record_path(&record.vp_id);
        let rendered = self.render(record)?;

        match std::fs::read_to_string(&path) {
            Ok(existing) if existing == rendered => {
                debug!(entity_type = %self.entity_type, vp_id = %record.vp_id, "record unchanged, skipping write");
                return Ok(false);
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::io(&path, e)),
        }

        self.write_atomic(&path, &rendered)?;
        debug!(entity_type = %self.entity_type, vp_id = %record.vp_id, "saved record");
        Ok(true)
    }

    fn delete(&self, vp_id: &VpId) -> Result<bool, StorageError> {
        let path = self.record_path(vp_id);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(entity_type = %self.entity_type, %vp_id, "deleted record");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(&path, e)),
        }
    }

    fn load(&self, vp_id: &VpId) -> Result<Option<EntityRecord>, StorageError> {
        let path = self.record_path(vp_id);
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io(&path, e)),
        };
        self.parse(&path, &contents, vp_id).map(Some)
    }

    /// Presence check only; the file is not parsed.
    fn exists(&self, vp_id: &VpId) -> Result<bool, StorageError> {
        Ok(self.record_path(vp_id).is_file())
    }

    fn ids(&self) -> Result<Vec<VpId>, StorageError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io(&self.dir, e)),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(&self.dir, e))?;
            let path = entry.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match VpId::parse(stem) {
                Ok(vp_id) => ids.push(vp_id),
                Err(e) => {
                    warn!(entity_type = %self.entity_type, path = %path.display(), error = %e, "ignoring record file with invalid name");
                }
            }
        }
        ids.sort();
        debug!(entity_type = %self.entity_type, count = ids.len(), "listed stored records");
        Ok(ids)
    }
}
