use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::export::ExportOptions;
use crate::mapper::MappingOptions;
use crate::persistence::{AdapterOptions, LockingMode, MigrationMode};
use crate::{AppError, AppResult};

/// Settings file for the migrator. Every field has a default, so `{}` is a
/// valid configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MigratorConfig {
    pub export: ExportConfig,
    pub import: ImportConfig,
    pub adapter: AdapterConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExportConfig {
    pub page_size: usize,
    pub concurrency: usize,
    pub write_attempts: u32,
    pub write_backoff_ms: u64,
    pub report_dir: Option<PathBuf>,
    pub mapping: MappingOptions,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            concurrency: 8,
            write_attempts: 3,
            write_backoff_ms: 50,
            report_dir: None,
            mapping: MappingOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImportConfig {
    pub report_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdapterConfig {
    pub migration_mode: MigrationMode,
    pub locking: LockingMode,
    pub lock_timeout_ms: u64,
    pub source_page_size: usize,
    pub mapping: MappingOptions,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            migration_mode: MigrationMode::Off,
            locking: LockingMode::Optimistic,
            lock_timeout_ms: 5_000,
            source_page_size: 100,
            mapping: MappingOptions::default(),
        }
    }
}

impl MigratorConfig {
    pub fn load(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| AppError::from(err).with_context("path", path.display().to_string()))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|err| AppError::from(err).with_context("path", path.display().to_string()))?;
        config
            .validate()
            .map_err(|err| err.with_context("path", path.display().to_string()))?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        let invalid = |field: &str| {
            AppError::new("CONFIG/INVALID", format!("{field} must be greater than zero"))
                .with_context("field", field)
        };
        if self.export.page_size == 0 {
            return Err(invalid("export.page_size"));
        }
        if self.export.concurrency == 0 {
            return Err(invalid("export.concurrency"));
        }
        if self.export.write_attempts == 0 {
            return Err(invalid("export.write_attempts"));
        }
        if self.adapter.source_page_size == 0 {
            return Err(invalid("adapter.source_page_size"));
        }
        Ok(())
    }

    pub fn export_options(
        &self,
        out_root: impl Into<PathBuf>,
        type_name: impl Into<String>,
        key_property: impl Into<String>,
    ) -> ExportOptions {
        ExportOptions {
            page_size: self.export.page_size,
            concurrency: self.export.concurrency,
            write_attempts: self.export.write_attempts,
            write_backoff: Duration::from_millis(self.export.write_backoff_ms),
            report_dir: self.export.report_dir.clone(),
            mapping: self.export.mapping.clone(),
            ..ExportOptions::new(out_root, type_name, key_property)
        }
    }

    pub fn adapter_options(&self) -> AdapterOptions {
        AdapterOptions {
            migration_mode: self.adapter.migration_mode,
            locking: self.adapter.locking,
            lock_timeout: Duration::from_millis(self.adapter.lock_timeout_ms),
            source_page_size: self.adapter.source_page_size,
            mapping: self.adapter.mapping.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::FieldErrorPolicy;
    use tempfile::tempdir;

    #[test]
    fn empty_object_uses_defaults() {
        let config: MigratorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, MigratorConfig::default());
        let adapter = config.adapter_options();
        assert_eq!(adapter.lock_timeout, Duration::from_secs(5));
        assert_eq!(adapter.locking, LockingMode::Optimistic);
        assert_eq!(adapter.migration_mode, MigrationMode::Off);
    }

    #[test]
    fn loads_sections_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("migrator.json");
        std::fs::write(
            &path,
            r#"{
                "export": {
                    "page_size": 25,
                    "mapping": {
                        "excluded_properties": ["Originator"],
                        "field_error_policy": "fail_record"
                    }
                },
                "adapter": { "migration_mode": "on", "locking": "pessimistic", "lock_timeout_ms": 250 }
            }"#,
        )
        .unwrap();

        let config = MigratorConfig::load(&path).unwrap();
        let export = config.export_options("/out", "OrderSaga", "OrderId");
        assert_eq!(export.page_size, 25);
        assert_eq!(export.concurrency, 8);
        assert!(export.mapping.excluded_properties.contains("Originator"));
        assert_eq!(export.mapping.field_error_policy, FieldErrorPolicy::FailRecord);

        let adapter = config.adapter_options();
        assert_eq!(adapter.migration_mode, MigrationMode::On);
        assert_eq!(adapter.locking, LockingMode::Pessimistic);
        assert_eq!(adapter.lock_timeout, Duration::from_millis(250));
    }

    #[test]
    fn rejects_unknown_fields_and_zero_sizes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"export": {"pagesize": 10}}"#).unwrap();
        let err = MigratorConfig::load(&path).unwrap_err();
        assert_eq!(err.context().get("path"), Some(&path.display().to_string()));

        std::fs::write(&path, r#"{"export": {"page_size": 0}}"#).unwrap();
        let err = MigratorConfig::load(&path).unwrap_err();
        assert_eq!(err.code(), "CONFIG/INVALID");
    }
}
