//! Moves saga state out of a partitioned table store and into a document
//! store: batch export to files, bulk import, and a persistence adapter that
//! can read from both stores while the move is under way.

pub mod cancel;
pub mod config;
pub mod document;
pub mod error;
pub mod export;
pub mod extract;
pub mod file_ops;
pub mod identity;
pub mod import;
pub mod logging;
pub mod mapper;
pub mod persistence;
pub mod record;
pub mod store;
pub mod time;

pub use cancel::CancelFlag;
pub use config::MigratorConfig;
pub use document::TargetDocument;
pub use error::{AppError, AppResult};
pub use export::{ExportOptions, ExportSummary, Exporter};
pub use identity::{derive, SagaKey};
pub use import::{ExportTree, ImportSummary, Importer};
pub use logging::init_logging;
pub use mapper::{MappingOptions, TypeMapper};
pub use persistence::{
    AdapterOptions, CreateOutcome, KeyLocks, LockingMode, MigrationMode, PersistenceError,
    RecordOrigin, SagaAdapter, SagaRecord, SagaState,
};
pub use record::{PropertyValue, SourceRecord, TypeTag};
