//! TOML-based configuration for rowmirror.
//!
//! The config file carries the mirror and database locations, sync
//! behaviour, and the entity schema descriptor (`[entities.*]`), which the
//! engine consumes as static input.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;
use crate::schema::{FieldKind, SchemaInfo};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Where the mirror and the database live.
    #[serde(default)]
    pub mirror: MirrorConfig,

    /// Sync behaviour settings.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Entity schema descriptor, keyed by entity type name.
    #[serde(default)]
    pub entities: BTreeMap<String, EntityConfig>,
}

// ---------------------------------------------------------------------------
// Mirror
// ---------------------------------------------------------------------------

/// Locations of persisted state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Root of the file mirror; one sub-directory per entity type.
    #[serde(default = "default_mirror_dir")]
    pub mirror_dir: PathBuf,

    /// SQLite database holding the entity tables and the id mapping.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_mirror_dir() -> PathBuf {
    PathBuf::from("db")
}
fn default_database_path() -> PathBuf {
    PathBuf::from("rowmirror.db")
}
fn default_log_level() -> String {
    "info".into()
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            mirror_dir: default_mirror_dir(),
            database_path: default_database_path(),
            log_level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sync behaviour
// ---------------------------------------------------------------------------

/// Sync behaviour configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// How many hops of dependents a selective sync pulls in. `0` disables
    /// dependent propagation; missing dependencies are always pulled in.
    #[serde(default = "default_propagation_depth")]
    pub propagation_depth: usize,

    /// Delete table rows that no mapping accounts for during a full pass.
    #[serde(default = "default_true")]
    pub delete_orphan_rows: bool,

    /// Create entity tables that do not exist yet when the engine opens.
    #[serde(default = "default_true")]
    pub create_missing_tables: bool,
}

fn default_propagation_depth() -> usize {
    1
}
fn default_true() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            propagation_depth: default_propagation_depth(),
            delete_orphan_rows: true,
            create_missing_tables: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Entity schema
// ---------------------------------------------------------------------------

/// One entity type as declared in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityConfig {
    /// Database table holding rows of this type.
    pub table: String,

    /// Auto-increment primary key column. Default `id`.
    #[serde(default = "default_id_column")]
    pub id_column: String,

    /// Columns, keyed by name.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldConfig>,
}

fn default_id_column() -> String {
    "id".into()
}

/// One column of an entity table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldConfig {
    /// Storage class. Ignored for reference fields, which are integers.
    #[serde(default)]
    pub kind: FieldKind,

    /// Entity type whose native key this column holds.
    #[serde(default)]
    pub references: Option<String>,
}

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// Relative `mirror_dir` and `database_path` values are resolved against
    /// the directory containing the config file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let mut config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }

        debug!(entities = config.entities.len(), "configuration parsed successfully");
        Ok(config)
    }

    /// Make relative paths absolute with respect to `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.mirror.mirror_dir.is_relative() {
            self.mirror.mirror_dir = base.join(&self.mirror.mirror_dir);
        }
        if self.mirror.database_path.is_relative() {
            self.mirror.database_path = base.join(&self.mirror.database_path);
        }
    }

    /// Validate settings and the entity schema.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mirror.mirror_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "mirror.mirror_dir".into(),
                detail: "mirror directory must not be empty".into(),
            });
        }
        if self.mirror.database_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "mirror.database_path".into(),
                detail: "database path must not be empty".into(),
            });
        }
        if !LOG_LEVELS.contains(&self.mirror.log_level.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "mirror.log_level".into(),
                detail: format!("expected one of {}", LOG_LEVELS.join(", ")),
            });
        }

        self.schema()?;
        Ok(())
    }

    /// Build the validated schema descriptor.
    pub fn schema(&self) -> Result<SchemaInfo, ConfigError> {
        Ok(SchemaInfo::from_config(&self.entities)?)
    }

    /// Convenience: load and validate in one call.
    pub fn load_and_validate<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SchemaError;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[mirror]
mirror_dir = "mirror"
database_path = "/var/lib/rowmirror/site.db"
log_level = "debug"

[sync]
propagation_depth = 2
delete_orphan_rows = false

[entities.user]
table = "users"
id_column = "ID"
[entities.user.fields]
user_login = {}
user_level = { kind = "integer" }

[entities.post]
table = "posts"
id_column = "ID"
[entities.post.fields]
post_title = { kind = "text" }
post_author = { references = "user" }
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: AppConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.mirror.log_level, "debug");
        assert_eq!(config.sync.propagation_depth, 2);
        assert!(!config.sync.delete_orphan_rows);
        assert!(config.sync.create_missing_tables);
        assert_eq!(config.entities.len(), 2);
        assert_eq!(
            config.entities["post"].fields["post_author"]
                .references
                .as_deref(),
            Some("user")
        );
        assert_eq!(
            config.entities["user"].fields["user_level"].kind,
            FieldKind::Integer
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_file_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rowmirror.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = AppConfig::load_from_file(&path).expect("load_from_file failed");
        assert_eq!(config.mirror.mirror_dir, dir.path().join("mirror"));
        assert_eq!(
            config.mirror.database_path,
            PathBuf::from("/var/lib/rowmirror/site.db")
        );
    }

    #[test]
    fn test_file_not_found() {
        let result = AppConfig::load_from_file("/nonexistent/rowmirror.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_validate_rejects_bad_log_level() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.mirror.log_level = "loud".into();
        let result = config.validate();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "mirror.log_level"
        ));
    }

    #[test]
    fn test_validate_rejects_empty_schema() {
        let config: AppConfig = toml::from_str("[mirror]\n").unwrap();
        let result = config.validate();
        assert!(matches!(
            result,
            Err(ConfigError::Schema(SchemaError::Empty))
        ));
    }

    #[test]
    fn test_defaults() {
        let minimal = r#"
[entities.note]
table = "notes"
"#;
        let config: AppConfig = toml::from_str(minimal).unwrap();
        assert_eq!(config.mirror.mirror_dir, PathBuf::from("db"));
        assert_eq!(config.mirror.database_path, PathBuf::from("rowmirror.db"));
        assert_eq!(config.mirror.log_level, "info");
        assert_eq!(config.sync.propagation_depth, 1);
        assert!(config.sync.delete_orphan_rows);
        assert_eq!(config.entities["note"].id_column, "id");
    }
}
