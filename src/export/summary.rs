use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::file_ops::write_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The key property is missing or cannot act as a key.
    Key,
    Mapping,
    Write,
    /// Another record in this run derived the same id.
    DuplicateId,
}

/// One record that did not make it to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordFailure {
    /// Absent only when no key value was available to derive from.
    pub id: Option<String>,
    pub partition_key: String,
    pub row_key: String,
    pub kind: FailureKind,
    pub reason: String,
}

/// A field dropped from an otherwise exported record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldWarning {
    pub id: String,
    pub field: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSummary {
    pub type_name: String,
    pub output_dir: String,
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: bool,
    pub failures: Vec<RecordFailure>,
    pub field_warnings: Vec<FieldWarning>,
}

impl ExportSummary {
    pub fn new(type_name: impl Into<String>, output_dir: &Path) -> Self {
        Self {
            type_name: type_name.into(),
            output_dir: output_dir.display().to_string(),
            ..Self::default()
        }
    }

    pub(crate) fn record_failure(&mut self, failure: RecordFailure) {
        self.failed += 1;
        self.failures.push(failure);
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExportReportFile<'a> {
    generated_at: String,
    summary: &'a ExportSummary,
}

/// Writes `export-<type>-YYYYMMDD-HHMMSS.json` into `reports_dir`.
pub fn write_export_report(reports_dir: &Path, summary: &ExportSummary) -> Result<PathBuf> {
    std::fs::create_dir_all(reports_dir)
        .with_context(|| format!("create reports directory {}", reports_dir.display()))?;

    let file_name = format!(
        "export-{}-{}.json",
        summary.type_name,
        Utc::now().format("%Y%m%d-%H%M%S")
    );
    let path = reports_dir.join(file_name);
    let payload = ExportReportFile {
        generated_at: Utc::now().to_rfc3339(),
        summary,
    };
    let json = serde_json::to_vec_pretty(&payload).context("serialize export report")?;
    write_atomic(&path, &json).with_context(|| format!("write export report {}", path.display()))?;
    Ok(path)
}
