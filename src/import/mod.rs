pub mod bundle;
pub mod execute;
pub mod report;

pub use bundle::{DocumentEntry, ExportTree, ImportTreeError};
pub use execute::{
    validate_document, ContainerSummary, DocumentFailure, ImportError, ImportSummary, Importer,
};
pub use report::write_import_report;
