use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;

use super::execute::ImportSummary;
use crate::file_ops::write_atomic;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ImportReportFile<'a> {
    generated_at: String,
    tree_path: String,
    summary: &'a ImportSummary,
}

/// Writes `import-YYYYMMDD-HHMMSS.json` into `reports_dir`.
pub fn write_import_report(
    reports_dir: &Path,
    tree_path: &Path,
    summary: &ImportSummary,
) -> Result<PathBuf> {
    std::fs::create_dir_all(reports_dir)
        .with_context(|| format!("create reports directory {}", reports_dir.display()))?;

    let timestamp = Utc::now().format("import-%Y%m%d-%H%M%S.json");
    let path = reports_dir.join(timestamp.to_string());
    let payload = ImportReportFile {
        generated_at: Utc::now().to_rfc3339(),
        tree_path: tree_path.display().to_string(),
        summary,
    };
    let json = serde_json::to_vec_pretty(&payload).context("serialize import report")?;
    write_atomic(&path, &json).with_context(|| format!("write import report {}", path.display()))?;
    Ok(path)
}
