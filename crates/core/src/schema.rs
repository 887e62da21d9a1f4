//! Entity schema descriptor.
//!
//! [`SchemaInfo`] is built once from the `[entities.*]` section of the config
//! and is read-only afterwards. It knows, for every entity type, its table,
//! its columns, and which columns reference other entity types. From the
//! reference graph it derives the order in which types must be synchronized.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::EntityConfig;
use crate::errors::SchemaError;
use crate::models::FieldValue;

/// Tables owned by the engine itself.
pub const RESERVED_TABLES: &[&str] = &["vp_id_map", "sync_runs", "kv_state"];

/// Field name reserved for the stable identifier in record files.
pub const VP_ID_FIELD: &str = "vp_id";

// ---------------------------------------------------------------------------
// Field kinds
// ---------------------------------------------------------------------------

/// Declared storage class of a column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    #[default]
    Text,
    Integer,
    Real,
}

impl FieldKind {
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
        }
    }

    /// Convert a value the way SQLite column affinity would, so a value read
    /// back from the table compares equal to the value that was written.
    /// Values that do not convert cleanly are returned unchanged. NaN is
    /// stored as NULL whatever the column.
    pub fn coerce(&self, value: FieldValue) -> FieldValue {
        match (self, value) {
            (_, FieldValue::Null) => FieldValue::Null,
            (_, FieldValue::Real(r)) if r.is_nan() => FieldValue::Null,
            (Self::Text, FieldValue::Integer(i)) => FieldValue::Text(i.to_string()),
            (Self::Text, FieldValue::Real(r)) => FieldValue::Text(real_to_text(r)),
            (Self::Integer, FieldValue::Text(s)) => match numeric_text(&s) {
                Some(FieldValue::Real(r)) if real_is_integral(r) => FieldValue::Integer(r as i64),
                Some(n) => n,
                None => FieldValue::Text(s),
            },
            (Self::Integer, FieldValue::Real(r)) if real_is_integral(r) => {
                FieldValue::Integer(r as i64)
            }
            (Self::Real, FieldValue::Integer(i)) => FieldValue::Real(i as f64),
            (Self::Real, FieldValue::Text(s)) => match numeric_text(&s) {
                Some(FieldValue::Integer(i)) => FieldValue::Real(i as f64),
                Some(n) => n,
                None => FieldValue::Text(s),
            },
            (_, other) => other,
        }
    }
}

/// Largest magnitude SQLite converts from REAL to INTEGER under integer
/// affinity (2^51).
const REAL_AS_INT_LIMIT: f64 = 2_251_799_813_685_248.0;

fn real_is_integral(r: f64) -> bool {
    r.fract() == 0.0 && r > -REAL_AS_INT_LIMIT && r < REAL_AS_INT_LIMIT
}

/// Text that SQLite reads as a number: an integer if it fits `i64`, else a
/// finite real. `inf` and `nan` stay text.
fn numeric_text(s: &str) -> Option<FieldValue> {
    let t = s.trim();
    if let Ok(i) = t.parse::<i64>() {
        return Some(FieldValue::Integer(i));
    }
    match t.parse::<f64>() {
        Ok(r) if r.is_finite() => Some(FieldValue::Real(r)),
        _ => None,
    }
}

/// SQLite renders whole reals below 1e15 with a trailing `.0`.
fn real_to_text(r: f64) -> String {
    if r.fract() == 0.0 && r.abs() < 1e15 {
        format!("{:.1}", r)
    } else {
        r.to_string()
    }
}

// ---------------------------------------------------------------------------
// Descriptor types
// ---------------------------------------------------------------------------

/// One column of an entity table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub name: String,
    pub kind: FieldKind,
    /// Entity type this column references, if it is a reference field.
    pub references: Option<String>,
}

/// One entity type and its table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityInfo {
    pub name: String,
    pub table: String,
    pub id_column: String,
    /// Columns other than the native key, sorted by name.
    pub fields: Vec<FieldInfo>,
}

impl EntityInfo {
    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn reference_fields(&self) -> impl Iterator<Item = &FieldInfo> {
        self.fields.iter().filter(|f| f.references.is_some())
    }

    /// Reference fields pointing at `entity_type`.
    pub fn fields_referencing<'a>(
        &'a self,
        entity_type: &'a str,
    ) -> impl Iterator<Item = &'a FieldInfo> {
        self.fields
            .iter()
            .filter(move |f| f.references.as_deref() == Some(entity_type))
    }

    /// Entity types this one depends on, excluding itself.
    pub fn dependencies(&self) -> BTreeSet<&str> {
        self.reference_fields()
            .filter_map(|f| f.references.as_deref())
            .filter(|t| *t != self.name)
            .collect()
    }
}

/// Validated schema for all entity types.
#[derive(Debug, Clone)]
pub struct SchemaInfo {
    entities: BTreeMap<String, EntityInfo>,
    order: Vec<String>,
}

impl SchemaInfo {
    /// Build and validate the descriptor from its config representation.
    pub fn from_config(entities: &BTreeMap<String, EntityConfig>) -> Result<Self, SchemaError> {
        if entities.is_empty() {
            return Err(SchemaError::Empty);
        }

        let mut infos = BTreeMap::new();
        let mut tables = BTreeSet::new();
        for (name, cfg) in entities {
            check_identifier(name)?;
            check_identifier(&cfg.table)?;
            check_identifier(&cfg.id_column)?;

            if RESERVED_TABLES.contains(&cfg.table.as_str()) || cfg.table.starts_with("sqlite_") {
                return Err(SchemaError::Reserved {
                    name: cfg.table.clone(),
                    detail: "table name is used by the sync engine".into(),
                });
            }
            if !tables.insert(cfg.table.clone()) {
                return Err(SchemaError::Reserved {
                    name: cfg.table.clone(),
                    detail: "table is declared by more than one entity type".into(),
                });
            }

            let mut fields = Vec::with_capacity(cfg.fields.len());
            for (field_name, field_cfg) in &cfg.fields {
                check_identifier(field_name)?;
                if field_name == VP_ID_FIELD || *field_name == cfg.id_column {
                    return Err(SchemaError::Reserved {
                        name: format!("{}.{}", name, field_name),
                        detail: "field name clashes with an identifier column".into(),
                    });
                }
                if let Some(target) = &field_cfg.references {
                    if !entities.contains_key(target) {
                        return Err(SchemaError::UnknownReferenceTarget {
                            entity_type: name.clone(),
                            field: field_name.clone(),
                            target: target.clone(),
                        });
                    }
                }
                fields.push(FieldInfo {
                    name: field_name.clone(),
                    // Reference columns always hold native integer keys.
                    kind: if field_cfg.references.is_some() {
                        FieldKind::Integer
                    } else {
                        field_cfg.kind
                    },
                    references: field_cfg.references.clone(),
                });
            }

            infos.insert(
                name.clone(),
                EntityInfo {
                    name: name.clone(),
                    table: cfg.table.clone(),
                    id_column: cfg.id_column.clone(),
                    fields,
                },
            );
        }

        let order = topological_order(&infos)?;
        debug!(order = ?order, "computed entity dependency order");
        Ok(Self {
            entities: infos,
            order,
        })
    }

    /// Look up an entity type.
    pub fn entity(&self, name: &str) -> Result<&EntityInfo, SchemaError> {
        self.entities
            .get(name)
            .ok_or_else(|| SchemaError::UnknownEntity(name.to_string()))
    }

    /// All entity types, by name.
    pub fn entities(&self) -> impl Iterator<Item = &EntityInfo> {
        self.entities.values()
    }

    /// Entity type names in dependency order: a type always comes after every
    /// type it references.
    pub fn dependency_order(&self) -> &[String] {
        &self.order
    }

    /// Every (entity type, field) pair whose field references `entity_type`,
    /// including self references.
    pub fn dependents_of<'a>(
        &'a self,
        entity_type: &'a str,
    ) -> Vec<(&'a EntityInfo, &'a FieldInfo)> {
        self.entities
            .values()
            .flat_map(|e| e.fields_referencing(entity_type).map(move |f| (e, f)))
            .collect()
    }
}

/// Kahn's algorithm over the "references" relation, ties broken by name.
fn topological_order(entities: &BTreeMap<String, EntityInfo>) -> Result<Vec<String>, SchemaError> {
    let mut remaining: BTreeMap<&str, BTreeSet<&str>> = entities
        .values()
        .map(|e| (e.name.as_str(), e.dependencies()))
        .collect();
    let mut order = Vec::with_capacity(entities.len());

    loop {
        let ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(name, _)| *name)
            .collect();
        if ready.is_empty() {
            break;
        }
        for name in ready {
            remaining.remove(name);
            for deps in remaining.values_mut() {
                deps.remove(name);
            }
            order.push(name.to_string());
        }
    }

    if remaining.is_empty() {
        Ok(order)
    } else {
        let cycle: Vec<&str> = remaining.keys().copied().collect();
        Err(SchemaError::DependencyCycle(cycle.join(", ")))
    }
}

/// Plain SQL identifier check; everything the engine interpolates into SQL
/// passes through here first.
pub(crate) fn check_identifier(name: &str) -> Result<(), SchemaError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(SchemaError::InvalidIdentifier(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<SchemaInfo, SchemaError> {
        #[derive(Deserialize)]
        struct Wrapper {
            entities: BTreeMap<String, EntityConfig>,
        }
        let w: Wrapper = toml::from_str(toml_str).expect("schema toml");
        SchemaInfo::from_config(&w.entities)
    }

    const BLOG: &str = r#"
[entities.comment]
table = "comments"
id_column = "comment_ID"
[entities.comment.fields]
comment_content = {}
comment_post_ID = { references = "post" }
user_id = { references = "user" }

[entities.post]
table = "posts"
id_column = "ID"
[entities.post.fields]
post_title = {}
post_author = { references = "user" }
post_parent = { references = "post" }

[entities.user]
table = "users"
id_column = "ID"
[entities.user.fields]
user_login = {}
user_level = { kind = "integer" }
"#;

    #[test]
    fn test_dependency_order() {
        let schema = parse(BLOG).unwrap();
        assert_eq!(schema.dependency_order(), ["user", "post", "comment"]);
    }

    #[test]
    fn test_independent_types_order_by_name() {
        let schema = parse(
            r#"
[entities.zeta]
table = "z"
[entities.alpha]
table = "a"
"#,
        )
        .unwrap();
        assert_eq!(schema.dependency_order(), ["alpha", "zeta"]);
        assert_eq!(schema.entity("alpha").unwrap().id_column, "id");
    }

    #[test]
    fn test_dependents_include_self_references() {
        let schema = parse(BLOG).unwrap();
        let mut deps: Vec<String> = schema
            .dependents_of("post")
            .into_iter()
            .map(|(e, f)| format!("{}.{}", e.name, f.name))
            .collect();
        deps.sort();
        assert_eq!(deps, ["comment.comment_post_ID", "post.post_parent"]);
    }

    #[test]
    fn test_reference_fields_are_integer_columns() {
        let schema = parse(BLOG).unwrap();
        let post = schema.entity("post").unwrap();
        assert_eq!(post.field("post_author").unwrap().kind, FieldKind::Integer);
        assert_eq!(post.field("post_title").unwrap().kind, FieldKind::Text);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let err = parse(
            r#"
[entities.a]
table = "a"
[entities.a.fields]
b_ref = { references = "b" }
[entities.b]
table = "b"
[entities.b.fields]
a_ref = { references = "a" }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, SchemaError::DependencyCycle(ref s) if s == "a, b"));
    }

    #[test]
    fn test_unknown_target_is_rejected() {
        let err = parse(
            r#"
[entities.a]
table = "a"
[entities.a.fields]
owner = { references = "ghost" }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, SchemaError::UnknownReferenceTarget { ref target, .. } if target == "ghost"));
    }

    #[test]
    fn test_invalid_and_reserved_names() {
        let err = parse("[entities.a]\ntable = \"bad table\"\n").unwrap_err();
        assert!(matches!(err, SchemaError::InvalidIdentifier(_)));

        let err = parse("[entities.a]\ntable = \"vp_id_map\"\n").unwrap_err();
        assert!(matches!(err, SchemaError::Reserved { .. }));

        let err = parse("[entities.a]\ntable = \"a\"\n[entities.a.fields]\nvp_id = {}\n").unwrap_err();
        assert!(matches!(err, SchemaError::Reserved { .. }));

        let err = SchemaInfo::from_config(&BTreeMap::new()).unwrap_err();
        assert!(matches!(err, SchemaError::Empty));
    }

    #[test]
    fn test_unknown_entity_lookup() {
        let schema = parse(BLOG).unwrap();
        assert!(matches!(
            schema.entity("widget"),
            Err(SchemaError::UnknownEntity(_))
        ));
    }

    #[test]
    fn test_coerce_matches_affinity() {
        assert_eq!(
            FieldKind::Integer.coerce(FieldValue::Text("42".into())),
            FieldValue::Integer(42)
        );
        assert_eq!(
            FieldKind::Integer.coerce(FieldValue::Text("abc".into())),
            FieldValue::Text("abc".into())
        );
        assert_eq!(
            FieldKind::Text.coerce(FieldValue::Integer(0)),
            FieldValue::Text("0".into())
        );
        assert_eq!(
            FieldKind::Real.coerce(FieldValue::Integer(2)),
            FieldValue::Real(2.0)
        );
        assert_eq!(FieldKind::Real.coerce(FieldValue::Null), FieldValue::Null);
    }

    #[test]
    fn test_coerce_numeric_text_into_integer_column() {
        let int = |s: &str| FieldKind::Integer.coerce(FieldValue::Text(s.into()));
        assert_eq!(int("1.0"), FieldValue::Integer(1));
        assert_eq!(int("1e3"), FieldValue::Integer(1000));
        assert_eq!(int(" 7 "), FieldValue::Integer(7));
        assert_eq!(int("1.5"), FieldValue::Real(1.5));
        assert_eq!(int("1e300"), FieldValue::Real(1e300));
        assert_eq!(int("inf"), FieldValue::Text("inf".into()));
        assert_eq!(int(""), FieldValue::Text("".into()));
    }

    #[test]
    fn test_coerce_nan_and_real_text() {
        for kind in [FieldKind::Text, FieldKind::Integer, FieldKind::Real] {
            assert_eq!(kind.coerce(FieldValue::Real(f64::NAN)), FieldValue::Null);
        }
        assert_eq!(
            FieldKind::Real.coerce(FieldValue::Text("1e3".into())),
            FieldValue::Real(1000.0)
        );
        assert_eq!(
            FieldKind::Real.coerce(FieldValue::Text("nan".into())),
            FieldValue::Text("nan".into())
        );
        assert_eq!(
            FieldKind::Text.coerce(FieldValue::Real(2.0)),
            FieldValue::Text("2.0".into())
        );
        assert_eq!(
            FieldKind::Text.coerce(FieldValue::Real(2.5)),
            FieldValue::Text("2.5".into())
        );
    }
}
