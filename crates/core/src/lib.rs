//! rowmirror core library.
//!
//! This crate keeps relational tables and a file mirror of their rows in
//! step: configuration and the entity schema, database persistence, stable
//! identifier translation, record storage, per-table synchronizers, the
//! orchestrating sync engine, and capture of the database into the mirror.

pub mod capture;
pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod schema;
pub mod storage;
pub mod sync_engine;
pub mod synchronizer;
pub mod translator;

// Re-exports for convenience.
pub use capture::{Capture, CaptureReport};
pub use config::AppConfig;
pub use db::Database;
pub use errors::CoreError;
pub use models::{AffectedEntity, EntityRecord, FieldValue, SyncScope, VpId};
pub use schema::SchemaInfo;
pub use storage::{EntityStorage, StorageFactory};
pub use sync_engine::{SyncEngine, SyncOutcome};
pub use synchronizer::{SyncReport, Synchronizer, SynchronizerRegistry};
pub use translator::IdTranslator;
