//! Batch export of one saga type into `<root>/<type>/<id>.json` files.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelFlag;
use crate::extract::{extract, ExtractionError};
use crate::file_ops::write_atomic_with_retry;
use crate::identity::derive;
use crate::mapper::{FieldErrorPolicy, MappingOptions, TypeMapper};
use crate::record::SourceRecord;
use crate::store::SourceStore;

pub mod summary;

pub use summary::{write_export_report, ExportSummary, FailureKind, FieldWarning, RecordFailure};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to enumerate source records: {0}")]
    Enumeration(#[from] ExtractionError),
    #[error("type name {0:?} cannot be used as a directory name")]
    InvalidTypeName(String),
    #[error("failed to create output directory {path}: {source}")]
    OutputDir {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to write export report: {0}")]
    Report(#[source] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub out_root: PathBuf,
    pub type_name: String,
    pub key_property: String,
    pub page_size: usize,
    /// Upper bound on file writes in flight.
    pub concurrency: usize,
    pub write_attempts: u32,
    pub write_backoff: Duration,
    pub report_dir: Option<PathBuf>,
    pub mapping: MappingOptions,
}

impl ExportOptions {
    pub fn new(
        out_root: impl Into<PathBuf>,
        type_name: impl Into<String>,
        key_property: impl Into<String>,
    ) -> Self {
        Self {
            out_root: out_root.into(),
            type_name: type_name.into(),
            key_property: key_property.into(),
            page_size: 100,
            concurrency: 8,
            write_attempts: 3,
            write_backoff: Duration::from_millis(50),
            report_dir: None,
            mapping: MappingOptions::default(),
        }
    }
}

/// Rejects names that would escape the output root or collide with the
/// tree's reserved entries (dot and underscore prefixes).
pub fn validate_type_name(name: &str) -> Result<(), ExportError> {
    let illegal = name.is_empty()
        || name.starts_with('.')
        || name.starts_with('_')
        || name.chars().any(|c| {
            c.is_control() || matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|')
        });
    if illegal {
        Err(ExportError::InvalidTypeName(name.to_string()))
    } else {
        Ok(())
    }
}

struct PreparedDocument {
    id: String,
    partition_key: String,
    row_key: String,
    path: PathBuf,
    bytes: Vec<u8>,
}

struct WriteOutcome {
    id: String,
    partition_key: String,
    row_key: String,
    result: io::Result<()>,
}

async fn write_prepared(
    prepared: PreparedDocument,
    attempts: u32,
    backoff: Duration,
) -> WriteOutcome {
    let result = write_atomic_with_retry(&prepared.path, prepared.bytes, attempts, backoff).await;
    WriteOutcome {
        id: prepared.id,
        partition_key: prepared.partition_key,
        row_key: prepared.row_key,
        result,
    }
}

pub struct Exporter {
    source: Arc<dyn SourceStore>,
    mapper: TypeMapper,
    options: ExportOptions,
    cancel: CancelFlag,
}

impl Exporter {
    pub fn new(source: Arc<dyn SourceStore>, options: ExportOptions) -> Self {
        Self {
            source,
            mapper: TypeMapper::new(options.mapping.clone()),
            options,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn type_dir(&self) -> PathBuf {
        self.options.out_root.join(&self.options.type_name)
    }

    /// Exports every record of the configured type.
    ///
    /// Per-record failures land in the summary. Only a failure to enumerate
    /// the source (or to set up the output directory) fails the run; writes
    /// already in flight are allowed to finish first.
    pub async fn run(&self) -> Result<ExportSummary, ExportError> {
        validate_type_name(&self.options.type_name)?;
        let type_dir = self.type_dir();
        tokio::fs::create_dir_all(&type_dir)
            .await
            .map_err(|source| ExportError::OutputDir {
                path: type_dir.display().to_string(),
                source,
            })?;

        let started = Instant::now();
        info!(
            target: "saga_migrator",
            event = "export_started",
            type_name = %self.options.type_name,
            key_property = %self.options.key_property,
            output_dir = %type_dir.display(),
        );

        let mut summary = ExportSummary::new(&self.options.type_name, &type_dir);
        let mut records = extract(
            self.source.clone(),
            self.options.type_name.clone(),
            self.options.page_size,
        );
        let mut claimed: HashMap<String, (String, String)> = HashMap::new();
        let mut writes = FuturesUnordered::new();
        let concurrency = self.options.concurrency.max(1);

        let enumeration = loop {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break Ok(());
            }
            let record = match records.next().await {
                Some(Ok(record)) => record,
                Some(Err(err)) => break Err(err),
                None => break Ok(()),
            };
            summary.total += 1;

            match self.prepare(&record, &type_dir, &mut claimed, &mut summary) {
                Ok(prepared) => writes.push(write_prepared(
                    prepared,
                    self.options.write_attempts,
                    self.options.write_backoff,
                )),
                Err(failure) => {
                    warn!(
                        target: "saga_migrator",
                        event = "export_record_failed",
                        id = failure.id.as_deref().unwrap_or("-"),
                        partition_key = %failure.partition_key,
                        row_key = %failure.row_key,
                        reason = %failure.reason,
                    );
                    summary.record_failure(failure);
                }
            }

            while writes.len() >= concurrency {
                if let Some(outcome) = writes.next().await {
                    settle(&mut summary, outcome);
                }
            }
        };

        while let Some(outcome) = writes.next().await {
            settle(&mut summary, outcome);
        }

        if let Err(err) = enumeration {
            error!(
                target: "saga_migrator",
                event = "export_aborted",
                type_name = %self.options.type_name,
                records_seen = summary.total,
                error = %err,
            );
            return Err(ExportError::Enumeration(err));
        }

        if let Some(reports_dir) = &self.options.report_dir {
            let path = write_export_report(reports_dir, &summary).map_err(ExportError::Report)?;
            debug!(target: "saga_migrator", event = "export_report_written", path = %path.display());
        }

        info!(
            target: "saga_migrator",
            event = "export_finished",
            type_name = %self.options.type_name,
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            elapsed_ms = started.elapsed().as_millis() as u64,
        );
        Ok(summary)
    }

    fn prepare(
        &self,
        record: &SourceRecord,
        type_dir: &Path,
        claimed: &mut HashMap<String, (String, String)>,
        summary: &mut ExportSummary,
    ) -> Result<PreparedDocument, RecordFailure> {
        let (partition_key, row_key) = record.row_identity();
        let failure = |id: Option<&str>, kind: FailureKind, reason: String| RecordFailure {
            id: id.map(str::to_string),
            partition_key: partition_key.clone(),
            row_key: row_key.clone(),
            kind,
            reason,
        };

        let key_property = &self.options.key_property;
        let key_value = record.get(key_property).ok_or_else(|| {
            failure(
                None,
                FailureKind::Key,
                format!("key property {key_property} is missing"),
            )
        })?;
        let key_text = key_value.key_text().ok_or_else(|| {
            failure(
                None,
                FailureKind::Key,
                format!(
                    "key property {key_property} holds a {} value",
                    key_value.tag()
                ),
            )
        })?;
        let id = derive(&self.options.type_name, key_property, &key_text);

        if let Some((owner_pk, owner_rk)) = claimed.get(&id) {
            return Err(failure(
                Some(&id),
                FailureKind::DuplicateId,
                format!("id already produced by row {owner_pk}/{owner_rk}"),
            ));
        }

        let mapped = self.mapper.map(&self.options.type_name, &id, record);
        if !mapped.field_errors.is_empty() {
            match self.mapper.options().field_error_policy {
                FieldErrorPolicy::FailRecord => {
                    let reasons: Vec<String> =
                        mapped.field_errors.iter().map(ToString::to_string).collect();
                    return Err(failure(Some(&id), FailureKind::Mapping, reasons.join("; ")));
                }
                FieldErrorPolicy::SkipField => {
                    for err in &mapped.field_errors {
                        warn!(
                            target: "saga_migrator",
                            event = "export_field_skipped",
                            id = %id,
                            field = err.field(),
                            reason = %err,
                        );
                        summary.field_warnings.push(FieldWarning {
                            id: id.clone(),
                            field: err.field().to_string(),
                            reason: err.to_string(),
                        });
                    }
                }
            }
        }

        let mismatches = self.mapper.verify(record, &mapped.document);
        if !mismatches.is_empty() {
            let reasons: Vec<String> = mismatches.iter().map(ToString::to_string).collect();
            return Err(failure(Some(&id), FailureKind::Mapping, reasons.join("; ")));
        }

        let bytes = mapped
            .document
            .to_json_bytes()
            .map_err(|err| failure(Some(&id), FailureKind::Mapping, err.to_string()))?;

        claimed.insert(id.clone(), (partition_key.clone(), row_key.clone()));
        Ok(PreparedDocument {
            path: type_dir.join(format!("{id}.json")),
            id,
            partition_key,
            row_key,
            bytes,
        })
    }
}

fn settle(summary: &mut ExportSummary, outcome: WriteOutcome) {
    match outcome.result {
        Ok(()) => {
            summary.succeeded += 1;
            debug!(target: "saga_migrator", event = "export_record_written", id = %outcome.id);
        }
        Err(err) => {
            warn!(
                target: "saga_migrator",
                event = "export_record_failed",
                id = %outcome.id,
                reason = %err,
            );
            summary.record_failure(RecordFailure {
                id: Some(outcome.id),
                partition_key: outcome.partition_key,
                row_key: outcome.row_key,
                kind: FailureKind::Write,
                reason: err.to_string(),
            });
        }
    }
}
