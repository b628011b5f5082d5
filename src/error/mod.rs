use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

use crate::export::ExportError;
use crate::extract::ExtractionError;
use crate::import::ImportTreeError;
use crate::mapper::MappingError;
use crate::persistence::PersistenceError;
use crate::store::StoreError;

/// Error surfaced by the CLI and embedded in run reports.
///
/// `code` is a stable `AREA/REASON` string; `context` carries the path, key or
/// field the failure concerns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<AppError>>,
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Code for foreign errors that carry no code of their own.
    pub const UNKNOWN_CODE: &'static str = "APP/UNKNOWN";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            context: HashMap::new(),
            cause: None,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    pub fn cause(&self) -> Option<&AppError> {
        self.cause.as_deref()
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_cause(mut self, cause: impl Into<AppError>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }

    pub fn log_with_event(&self, event: &'static str) {
        tracing::error!(
            target: "saga_migrator",
            event,
            code = %self.code,
            message = %self.message,
            context = ?self.context,
            cause = self.cause.as_ref().map(|cause| cause.code.as_str()),
        );
    }

    /// Walks a foreign error chain, one nested `AppError` per link.
    fn from_chain(err: &(dyn StdError + 'static)) -> Self {
        if let Some(app) = err.downcast_ref::<AppError>() {
            return app.clone();
        }
        let mut converted = AppError::new(Self::UNKNOWN_CODE, err.to_string());
        if let Some(source) = err.source() {
            converted.cause = Some(Box::new(Self::from_chain(source)));
        }
        converted
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if !self.context.is_empty() {
            let mut pairs: Vec<_> = self.context.iter().collect();
            pairs.sort();
            let rendered: Vec<String> = pairs.iter().map(|(k, v)| format!("{k}={v}")).collect();
            write!(f, " ({})", rendered.join(", "))?;
        }
        Ok(())
    }
}

impl StdError for AppError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::from_chain(error.as_ref())
    }
}

impl From<io::Error> for AppError {
    fn from(error: io::Error) -> Self {
        let converted = AppError::new(format!("IO/{:?}", error.kind()), error.to_string());
        match error.raw_os_error() {
            Some(os_code) => converted.with_context("os_code", os_code.to_string()),
            None => converted,
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        use serde_json::error::Category;
        let code = match error.classify() {
            Category::Io => "JSON/IO",
            Category::Syntax => "JSON/SYNTAX",
            Category::Data => "JSON/DATA",
            Category::Eof => "JSON/EOF",
        };
        let converted = AppError::new(code, error.to_string());
        if error.line() == 0 {
            return converted;
        }
        converted
            .with_context("line", error.line().to_string())
            .with_context("column", error.column().to_string())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::Io(err) => AppError::from(err).with_context("source", "sqlite"),
            sqlx::Error::PoolTimedOut => {
                AppError::new("DB/POOL_TIMEOUT", "Timed out waiting for a database connection")
            }
            sqlx::Error::PoolClosed => AppError::new("DB/POOL_CLOSED", "Database pool is closed"),
            sqlx::Error::Database(db) => {
                let code = db
                    .code()
                    .map(|code| format!("DB/SQLITE_{code}"))
                    .unwrap_or_else(|| "DB/DATABASE".to_string());
                AppError::new(code, db.message().to_string())
            }
            other => AppError::new("DB/ERROR", other.to_string()),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Database(err) => AppError::from(err).with_context("source", "store"),
            other => AppError::new(format!("STORE/{}", other.code()), other.to_string()),
        }
    }
}

impl From<ExtractionError> for AppError {
    fn from(error: ExtractionError) -> Self {
        let code = match &error {
            ExtractionError::Store { .. } => "EXTRACT/STORE",
            ExtractionError::PaginationLoop { .. } => "EXTRACT/PAGINATION_LOOP",
            ExtractionError::InvalidPageSize => "EXTRACT/PAGE_SIZE",
        };
        AppError::new(code, error.to_string())
    }
}

impl From<MappingError> for AppError {
    fn from(error: MappingError) -> Self {
        AppError::new("MAPPING/FIELD", error.to_string()).with_context("field", error.field())
    }
}

impl From<ExportError> for AppError {
    fn from(error: ExportError) -> Self {
        match error {
            ExportError::Enumeration(inner) => {
                AppError::new("EXPORT/ENUMERATION", "Failed to enumerate source records")
                    .with_cause(inner)
            }
            ExportError::InvalidTypeName(name) => {
                AppError::new("EXPORT/TYPE_NAME", "Type name is not a legal directory name")
                    .with_context("type_name", name)
            }
            ExportError::OutputDir { path, source } => AppError::from(source)
                .with_context("operation", "create_output_dir")
                .with_context("path", path),
            ExportError::Report(err) => {
                AppError::new("EXPORT/REPORT", "Failed to write export report").with_cause(err)
            }
        }
    }
}

impl From<ImportTreeError> for AppError {
    fn from(error: ImportTreeError) -> Self {
        let code = match &error {
            ImportTreeError::RootMissing(_) => "IMPORT/ROOT_MISSING",
            ImportTreeError::TypeMissing(_) => "IMPORT/TYPE_MISSING",
            ImportTreeError::Walk { .. } => "IMPORT/WALK",
        };
        AppError::new(code, error.to_string())
    }
}

impl From<PersistenceError> for AppError {
    fn from(error: PersistenceError) -> Self {
        let code = match &error {
            PersistenceError::Lookup { .. } => "ADAPTER/LOOKUP",
            PersistenceError::Lock(_) => "ADAPTER/LOCK_TIMEOUT",
            PersistenceError::Concurrency { .. } => "ADAPTER/CONCURRENCY",
            PersistenceError::Write { .. } => "ADAPTER/WRITE",
            PersistenceError::CorruptDocument { .. } => "ADAPTER/CORRUPT_DOCUMENT",
            PersistenceError::Mapping { .. } => "ADAPTER/MAPPING",
            PersistenceError::InvalidState { .. } => "ADAPTER/INVALID_STATE",
            PersistenceError::Configuration(_) => "ADAPTER/CONFIGURATION",
        };
        AppError::new(code, error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::KeyLockError;
    use anyhow::Context;
    use std::time::Duration;

    #[test]
    fn enumeration_failure_keeps_its_cause() {
        let inner = ExtractionError::Store {
            type_name: "OrderSaga".into(),
            page: 2,
            source: StoreError::Unavailable("offline".into()),
        };
        let app_error = AppError::from(ExportError::Enumeration(inner));
        assert_eq!(app_error.code(), "EXPORT/ENUMERATION");
        let cause = app_error.cause().expect("cause present");
        assert_eq!(cause.code(), "EXTRACT/STORE");
        assert!(cause.message().contains("page 2"));
    }

    #[test]
    fn report_failures_convert_their_anyhow_chain() {
        let err = (|| -> anyhow::Result<()> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only volume"))
                .context("write export report")
        })()
        .unwrap_err();

        let app_error = AppError::from(ExportError::Report(err));
        assert_eq!(app_error.code(), "EXPORT/REPORT");
        let outer = app_error.cause().expect("context link");
        assert_eq!(outer.message(), "write export report");
        assert_eq!(outer.code(), AppError::UNKNOWN_CODE);
        let root = outer.cause().expect("io link");
        assert!(root.message().contains("read-only volume"));
    }

    #[test]
    fn lock_timeouts_have_a_stable_code() {
        let err = PersistenceError::Lock(KeyLockError::TimedOut {
            key: "abc".into(),
            waited: Duration::from_millis(20),
        });
        assert_eq!(AppError::from(err).code(), "ADAPTER/LOCK_TIMEOUT");
    }

    #[test]
    fn store_errors_are_prefixed() {
        let app_error = AppError::from(StoreError::PreconditionFailed { id: "x".into() });
        assert_eq!(app_error.code(), "STORE/PRECONDITION_FAILED");
    }

    #[test]
    fn config_syntax_errors_carry_position() {
        let err = serde_json::from_str::<serde_json::Value>("{\"export\": }").unwrap_err();
        let app_error = AppError::from(err).with_context("path", "migrator.json");
        assert_eq!(app_error.code(), "JSON/SYNTAX");
        assert!(app_error.context().contains_key("line"));
        assert!(app_error.context().contains_key("column"));
        assert!(app_error.to_string().starts_with("[JSON/SYNTAX]"));
    }

    #[test]
    fn serialized_form_omits_empty_parts() {
        let error = AppError::new("IMPORT/ROOT_MISSING", "export root not found: /x");
        let value = serde_json::to_value(&error).expect("serialize app error");
        assert_eq!(value["code"], "IMPORT/ROOT_MISSING");
        assert!(value.get("context").is_none());
        assert!(value.get("cause").is_none());
    }
}
