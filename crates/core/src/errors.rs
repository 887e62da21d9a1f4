//! Error types for the rowmirror core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Schema errors
// ---------------------------------------------------------------------------

/// Errors in the entity schema descriptor. These are fatal to a whole
/// invocation: no per-entity recovery is possible.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// The schema declares no entity types at all.
    #[error("schema declares no entity types")]
    Empty,

    /// An entity type was requested that the schema does not declare.
    #[error("unknown entity type '{0}'")]
    UnknownEntity(String),

    /// A reference field points to an entity type that is not declared.
    #[error("field '{entity_type}.{field}' references unknown entity type '{target}'")]
    UnknownReferenceTarget {
        entity_type: String,
        field: String,
        target: String,
    },

    /// A table, column, or entity name is not a plain SQL identifier.
    #[error("invalid identifier '{0}': expected [A-Za-z_][A-Za-z0-9_]*")]
    InvalidIdentifier(String),

    /// A name collides with something the engine reserves for itself.
    #[error("'{name}' is reserved: {detail}")]
    Reserved { name: String, detail: String },

    /// Two or more entity types reference each other.
    #[error("dependency cycle between entity types: {0}")]
    DependencyCycle(String),
}

// ---------------------------------------------------------------------------
// Storage errors
// ---------------------------------------------------------------------------

/// Errors from the file mirror.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No record with the given stable identifier is stored.
    #[error("{entity_type} record not found: {vp_id}")]
    RecordNotFound { entity_type: String, vp_id: String },

    /// A stable identifier is empty or contains characters that cannot be
    /// used in a file name.
    #[error("invalid vp_id '{0}'")]
    InvalidVpId(String),

    /// Underlying file read/write failure.
    #[error("storage I/O error at '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A record file exists but is not a valid record.
    #[error("failed to parse record file '{path}': {detail}")]
    Parse { path: String, detail: String },

    /// A record could not be rendered to its file format.
    #[error("failed to serialize {entity_type} record {vp_id}: {detail}")]
    Serialize {
        entity_type: String,
        vp_id: String,
        detail: String,
    },
}

impl StorageError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// Sync errors
// ---------------------------------------------------------------------------

/// Errors from the synchronizers and the orchestrating engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A reference field points to an entity that has no native key yet.
    /// Re-running after the referenced entity has been synchronized resolves
    /// it; seeing it usually means a dependency was left out of the scope.
    #[error(
        "unresolved reference: {entity_type} {vp_id} field '{field}' points to \
         {target_type} {target_vp_id}, which has no native key"
    )]
    UnresolvedReference {
        entity_type: String,
        vp_id: String,
        field: String,
        target_type: String,
        target_vp_id: String,
    },

    /// Another run is already in progress on this engine.
    #[error("sync already in progress (started at {started_at})")]
    AlreadyRunning { started_at: String },

    /// Storage error while reading the mirror.
    #[error("sync storage error: {0}")]
    StorageError(#[from] StorageError),

    /// Database error while writing rows or mappings.
    #[error("sync database error: {0}")]
    DatabaseError(#[from] DatabaseError),

    /// Schema error (unknown entity type and the like).
    #[error("sync schema error: {0}")]
    SchemaError(#[from] SchemaError),
}

impl SyncError {
    /// Whether this is an [`SyncError::UnresolvedReference`].
    pub fn is_unresolved_reference(&self) -> bool {
        matches!(self, Self::UnresolvedReference { .. })
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// The `[entities]` schema descriptor is invalid.
    #[error("invalid entity schema: {0}")]
    Schema(#[from] SchemaError),

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
