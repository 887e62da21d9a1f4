//! Domain model types shared by storage, the synchronizers, and the engine.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Value, ValueRef};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::StorageError;

// ---------------------------------------------------------------------------
// Stable identifier
// ---------------------------------------------------------------------------

/// Stable, content-independent identifier of a logical entity.
///
/// Assigned once when the entity is first captured and never reused. Fresh
/// identifiers are 32 uppercase hex characters; any token made of ASCII
/// letters, digits, `-` and `_` is accepted so records written elsewhere stay
/// loadable (the identifier doubles as a file name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VpId(String);

impl VpId {
    /// Generate a fresh identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string().to_uppercase())
    }

    /// Validate and wrap an identifier.
    pub fn parse(s: &str) -> Result<Self, StorageError> {
        let valid = !s.is_empty()
            && s.len() <= 128
            && s.bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(StorageError::InvalidVpId(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for VpId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for VpId {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<VpId> for String {
    fn from(id: VpId) -> Self {
        id.0
    }
}

impl ToSql for VpId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(ValueRef::Text(self.0.as_bytes())))
    }
}

impl FromSql for VpId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = String::column_result(value)?;
        Self::parse(&s).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

// ---------------------------------------------------------------------------
// Field values
// ---------------------------------------------------------------------------

/// A scalar column value.
///
/// `Null` is never written to record files: an absent field and a NULL
/// column mean the same thing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Real(f64),
    Text(String),
    Null,
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(i) => write!(f, "{}", i),
            Self::Real(r) => write!(f, "{}", r),
            Self::Text(s) => f.write_str(s),
            Self::Null => f.write_str("NULL"),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<i32> for FieldValue {
    fn from(i: i32) -> Self {
        Self::Integer(i64::from(i))
    }
}

impl From<f64> for FieldValue {
    fn from(r: f64) -> Self {
        Self::Real(r)
    }
}

impl From<&VpId> for FieldValue {
    fn from(id: &VpId) -> Self {
        Self::Text(id.as_str().to_string())
    }
}

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            Self::Real(r) => ToSqlOutput::Owned(Value::Real(*r)),
            Self::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Self::Null => ToSqlOutput::Owned(Value::Null),
        })
    }
}

impl FromSql for FieldValue {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(match value {
            ValueRef::Null => Self::Null,
            ValueRef::Integer(i) => Self::Integer(i),
            ValueRef::Real(r) => Self::Real(r),
            ValueRef::Text(t) | ValueRef::Blob(t) => {
                Self::Text(String::from_utf8_lossy(t).into_owned())
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Entity record
// ---------------------------------------------------------------------------

/// One logical row of one entity type, as kept in the file mirror.
///
/// Reference fields hold the [`VpId`] of the referenced entity as text,
/// never a native key.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub vp_id: VpId,
    pub fields: BTreeMap<String, FieldValue>,
}

impl EntityRecord {
    pub fn new(vp_id: VpId) -> Self {
        Self {
            vp_id,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style setter.
    pub fn with_field(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<FieldValue>) {
        self.fields.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// The stable identifier stored in a reference field, if any.
    ///
    /// NULL and empty text mean "no reference".
    pub fn reference(&self, name: &str) -> Option<&str> {
        match self.fields.get(name) {
            Some(FieldValue::Text(s)) if !s.is_empty() => Some(s),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Synchronization scope
// ---------------------------------------------------------------------------

/// An entity named in a selective synchronization.
///
/// `parent` records why it is in scope: itself when it changed directly, or
/// the related entity whose change pulled it in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffectedEntity {
    pub vp_id: VpId,
    pub parent: VpId,
}

impl AffectedEntity {
    /// An entity that changed itself.
    pub fn changed(vp_id: VpId) -> Self {
        Self {
            parent: vp_id.clone(),
            vp_id,
        }
    }

    /// An entity pulled in by a change to `parent`.
    pub fn via(vp_id: VpId, parent: VpId) -> Self {
        Self { vp_id, parent }
    }
}

/// What a synchronization pass reconciles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncScope {
    /// The whole table against the whole stored set.
    Everything,
    /// Only the listed entities; each synchronizer picks out its own type.
    Entities(Vec<AffectedEntity>),
}

impl SyncScope {
    /// Short label for logs and the run history.
    pub fn label(&self) -> String {
        match self {
            Self::Everything => "everything".to_string(),
            Self::Entities(list) => format!("entities({})", list.len()),
        }
    }
}
