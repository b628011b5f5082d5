use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::bundle::{DocumentEntry, ExportTree};
use crate::cancel::CancelFlag;
use crate::identity::is_derived_id;
use crate::persistence::{KeyLockError, KeyLocks};
use crate::store::{StoreError, TargetStore};

/// Why a single document was not imported. The batch carries on.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid json in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("file name {stem:?} is not a derived document id")]
    ForeignId { stem: String },
    #[error("document is not a json object")]
    NotAnObject,
    #[error("document id {found:?} does not match file name")]
    IdMismatch { found: Option<String> },
    #[error("partition key {found:?} does not match document id")]
    PartitionKeyMismatch { found: Option<String> },
    #[error("typeName {found:?} does not match container {container}")]
    TypeMismatch {
        container: String,
        found: Option<String>,
    },
    #[error("target store rejected document: {0}")]
    Rejected(#[from] StoreError),
    #[error(transparent)]
    Lock(#[from] KeyLockError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentFailure {
    pub container: String,
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSummary {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: bool,
    pub containers: BTreeMap<String, ContainerSummary>,
    pub failures: Vec<DocumentFailure>,
}

impl ImportSummary {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }
}

/// Loads an export tree into a document store with create-or-replace
/// semantics, so rerunning an import converges on the same state.
pub struct Importer {
    target: Arc<dyn TargetStore>,
    locks: Option<(KeyLocks, Duration)>,
    cancel: CancelFlag,
}

impl Importer {
    pub fn new(target: Arc<dyn TargetStore>) -> Self {
        Self {
            target,
            locks: None,
            cancel: CancelFlag::new(),
        }
    }

    /// Serialises each upsert with live adapter traffic on the same key.
    pub fn with_key_locks(mut self, locks: KeyLocks, wait: Duration) -> Self {
        self.locks = Some((locks, wait));
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn run(&self, tree: &ExportTree) -> ImportSummary {
        let started = Instant::now();
        info!(
            target: "saga_migrator",
            event = "import_started",
            root = %tree.root().display(),
            documents = tree.document_count(),
        );

        let mut summary = ImportSummary::default();
        'containers: for (container, documents) in tree.containers() {
            let mut container_summary = ContainerSummary::default();
            for entry in documents {
                if self.cancel.is_cancelled() {
                    summary.cancelled = true;
                    summary.containers.insert(container.to_string(), container_summary);
                    break 'containers;
                }
                summary.total += 1;
                container_summary.total += 1;
                match self.import_document(entry).await {
                    Ok(()) => {
                        summary.succeeded += 1;
                        container_summary.succeeded += 1;
                        debug!(
                            target: "saga_migrator",
                            event = "import_document_written",
                            container = %entry.container,
                            id = %entry.id,
                        );
                    }
                    Err(err) => {
                        warn!(
                            target: "saga_migrator",
                            event = "import_document_failed",
                            container = %entry.container,
                            id = %entry.id,
                            reason = %err,
                        );
                        summary.failed += 1;
                        container_summary.failed += 1;
                        summary.failures.push(DocumentFailure {
                            container: entry.container.clone(),
                            id: entry.id.clone(),
                            reason: err.to_string(),
                        });
                    }
                }
            }
            summary.containers.insert(container.to_string(), container_summary);
        }

        info!(
            target: "saga_migrator",
            event = "import_finished",
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            elapsed_ms = started.elapsed().as_millis() as u64,
        );
        summary
    }

    async fn import_document(&self, entry: &DocumentEntry) -> Result<(), ImportError> {
        let path = entry.path.clone();
        let body = tokio::fs::read(&path).await.map_err(|source| ImportError::Read {
            path: path.display().to_string(),
            source,
        })?;
        validate_document(entry, &body)?;

        let _guard = match &self.locks {
            Some((locks, wait)) => Some(locks.acquire(&entry.id, *wait).await?),
            None => None,
        };
        self.target
            .upsert(&entry.container, &entry.id, &entry.id, body)
            .await?;
        Ok(())
    }
}

/// Checks the body against the file it came from before anything is written.
pub fn validate_document(entry: &DocumentEntry, body: &[u8]) -> Result<(), ImportError> {
    if !is_derived_id(&entry.id) {
        return Err(ImportError::ForeignId {
            stem: entry.id.clone(),
        });
    }
    let value: Value = serde_json::from_slice(body).map_err(|source| ImportError::Parse {
        path: entry.path.display().to_string(),
        source,
    })?;
    let object = value.as_object().ok_or(ImportError::NotAnObject)?;
    let text = |field: &str| object.get(field).and_then(Value::as_str).map(str::to_string);

    let id = text("id");
    if id.as_deref() != Some(entry.id.as_str()) {
        return Err(ImportError::IdMismatch { found: id });
    }
    let partition_key = text("partitionKey");
    if partition_key.as_deref() != Some(entry.id.as_str()) {
        return Err(ImportError::PartitionKeyMismatch {
            found: partition_key,
        });
    }
    let type_name = text("typeName");
    if type_name.as_deref() != Some(entry.container.as_str()) {
        return Err(ImportError::TypeMismatch {
            container: entry.container.clone(),
            found: type_name,
        });
    }
    Ok(())
}
