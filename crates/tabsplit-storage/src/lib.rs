//! Tabsplit storage crate - an embedded object store over SQLite.
//!
//! Collections of JSON documents with secondary indexes, closure-based
//! transactions behind a lazily opened gateway, repositories for
//! calculations, images, templates and settings, paginated queries,
//! retention cleanup, and snapshot export/import.

pub mod db;
pub mod gateway;
pub mod migrations;
pub mod queries;
pub mod repository;
pub mod retention;
pub mod schema;
pub mod settings;
pub mod template;
pub mod transfer;
pub mod tx;
pub mod vault;

pub use db::Database;
pub use gateway::{DatabaseTarget, Gateway};
pub use queries::{
    CalculationQuery, CalculationSortField, QueryService, SortDirection, StorageStats,
    TemplateQuery, TemplateSortField,
};
pub use repository::{CalculationRepository, ImageRepository};
pub use retention::{
    CleanupOptions, CleanupReport, DanglingReference, IntegrityReport, QuotaStatus,
    RetentionManager,
};
pub use schema::SCHEMA_VERSION;
pub use settings::SettingsRepository;
pub use template::TemplateRepository;
pub use transfer::{
    validate_snapshot, ExportOptions, ImportCounts, ImportOptions, ImportReport, Snapshot,
    SnapshotImage, SnapshotMetadata, SnapshotValidation, TransferService,
};
pub use tx::{CursorSpec, CursorStep, Direction, IndexKey, KeyRange, Tx, TxMode};
pub use vault::Vault;
