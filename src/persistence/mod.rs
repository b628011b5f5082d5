//! Live saga persistence over the document store, with an optional read-only
//! fallback to the legacy table store while a migration is in progress.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::document::TargetDocument;
use crate::identity::SagaKey;
use crate::mapper::{decode_value, FieldErrorPolicy, MappingError, MappingOptions, TypeMapper};
use crate::record::{PropertyValue, TypeTag};
use crate::store::{SourceStore, StoreError, TargetStore};

pub mod locks;

pub use locks::{KeyLockError, KeyLockGuard, KeyLocks};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("lookup of {key} failed: {source}")]
    Lookup {
        key: String,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Lock(#[from] KeyLockError),
    #[error("concurrent update of {key}: {reason}")]
    Concurrency { key: String, reason: String },
    #[error("write of {key} failed: {source}")]
    Write {
        key: String,
        #[source]
        source: StoreError,
    },
    #[error("stored document for {key} is unreadable: {reason}")]
    CorruptDocument { key: String, reason: String },
    #[error("legacy record for {key} could not be mapped: {source}")]
    Mapping {
        key: String,
        #[source]
        source: MappingError,
    },
    #[error("saga state for {key} does not match its type tags: {source}")]
    InvalidState {
        key: String,
        #[source]
        source: MappingError,
    },
    #[error("invalid adapter configuration: {0}")]
    Configuration(String),
}

/// Whether lookups may fall back to the legacy store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationMode {
    /// Target store only.
    #[default]
    Off,
    /// Target first, then the legacy store.
    On,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockingMode {
    /// Creates are blind upserts. Concurrent creates of one key all succeed and
    /// the last write wins.
    #[default]
    Optimistic,
    /// Creates and saves hold the key lock.
    Pessimistic,
}

#[derive(Debug, Clone)]
pub struct AdapterOptions {
    pub migration_mode: MigrationMode,
    pub locking: LockingMode,
    pub lock_timeout: Duration,
    /// Page size for the legacy table walk in `find_by_key`.
    pub source_page_size: usize,
    pub mapping: MappingOptions,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            migration_mode: MigrationMode::Off,
            locking: LockingMode::Optimistic,
            lock_timeout: Duration::from_secs(5),
            source_page_size: 100,
            mapping: MappingOptions::default(),
        }
    }
}

/// The saga data fields and their type tags, as stored in `data`/`types`.
///
/// `set` only accepts a value its tag can decode. State assembled through the
/// public maps is checked again by `validate` before every write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SagaState {
    pub data: Map<String, Value>,
    pub types: BTreeMap<String, TypeTag>,
}

impl SagaState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(
        mut self,
        name: impl Into<String>,
        value: impl Into<Value>,
        tag: TypeTag,
    ) -> Result<Self, MappingError> {
        self.set(name, value, tag)?;
        Ok(self)
    }

    pub fn set(
        &mut self,
        name: impl Into<String>,
        value: impl Into<Value>,
        tag: TypeTag,
    ) -> Result<(), MappingError> {
        let name = name.into();
        let value = value.into();
        decode_value(&name, tag, &value)?;
        self.types.insert(name.clone(), tag);
        self.data.insert(name, value);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    /// Every field has a tag, every tag has a field, and each value decodes.
    pub fn validate(&self) -> Result<(), MappingError> {
        for (name, value) in &self.data {
            let tag = self.types.get(name).copied().ok_or_else(|| MappingError::Decode {
                field: name.clone(),
                tag: TypeTag::String,
                reason: "no type tag".to_string(),
            })?;
            decode_value(name, tag, value)?;
        }
        match self.types.iter().find(|(name, _)| !self.data.contains_key(*name)) {
            Some((name, tag)) => Err(MappingError::Decode {
                field: name.clone(),
                tag: *tag,
                reason: "field missing".to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Where a record was read from, and what a save must do with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOrigin {
    Target { etag: String },
    /// Read from the legacy store. Saving creates the target document.
    Source { partition_key: String, row_key: String },
    Created { etag: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SagaRecord {
    pub key: SagaKey,
    pub id: String,
    pub state: SagaState,
    pub origin: RecordOrigin,
}

impl SagaRecord {
    pub fn is_from_source(&self) -> bool {
        matches!(self.origin, RecordOrigin::Source { .. })
    }

    pub fn to_document(&self) -> TargetDocument {
        TargetDocument {
            id: self.id.clone(),
            partition_key: self.id.clone(),
            type_name: self.key.type_name.clone(),
            data: self.state.data.clone(),
            types: self.state.types.clone(),
        }
    }

    /// Typed view of one field.
    pub fn field(&self, name: &str) -> Result<PropertyValue, MappingError> {
        self.to_document().decode_field(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(SagaRecord),
    /// Another writer created the key first; this is its record.
    Existing(SagaRecord),
}

impl CreateOutcome {
    pub fn record(&self) -> &SagaRecord {
        match self {
            Self::Created(record) | Self::Existing(record) => record,
        }
    }

    pub fn into_record(self) -> SagaRecord {
        match self {
            Self::Created(record) | Self::Existing(record) => record,
        }
    }
}

/// One adapter per process, its behaviour fixed at construction.
pub struct SagaAdapter {
    target: Arc<dyn TargetStore>,
    source: Option<Arc<dyn SourceStore>>,
    locks: KeyLocks,
    mapper: TypeMapper,
    options: AdapterOptions,
}

impl SagaAdapter {
    /// `source` is required when the migration mode is on.
    pub fn new(
        target: Arc<dyn TargetStore>,
        source: Option<Arc<dyn SourceStore>>,
        locks: KeyLocks,
        options: AdapterOptions,
    ) -> Result<Self, PersistenceError> {
        if options.migration_mode == MigrationMode::On && source.is_none() {
            return Err(PersistenceError::Configuration(
                "migration mode is on but no source store was given".into(),
            ));
        }
        if options.source_page_size == 0 {
            return Err(PersistenceError::Configuration(
                "source page size must be greater than zero".into(),
            ));
        }
        Ok(Self {
            target,
            source,
            locks,
            mapper: TypeMapper::new(options.mapping.clone()),
            options,
        })
    }

    pub fn options(&self) -> &AdapterOptions {
        &self.options
    }

    pub fn locks(&self) -> &KeyLocks {
        &self.locks
    }

    pub async fn find_by_key(&self, key: &SagaKey) -> Result<Option<SagaRecord>, PersistenceError> {
        let id = key.document_id();
        if let Some(record) = self.read_target(key, &id).await? {
            return Ok(Some(record));
        }
        if self.options.migration_mode == MigrationMode::Off {
            return Ok(None);
        }
        self.read_source(key, &id).await
    }

    /// Stores a new saga instance.
    ///
    /// Under pessimistic locking the key is held for the re-check and the
    /// insert, and an existing target record is returned instead of being
    /// overwritten.
    pub async fn create(
        &self,
        key: &SagaKey,
        state: SagaState,
    ) -> Result<CreateOutcome, PersistenceError> {
        let id = key.document_id();
        let mut record = SagaRecord {
            key: key.clone(),
            id: id.clone(),
            state,
            origin: RecordOrigin::Created {
                etag: String::new(),
            },
        };
        let body = encode(&record)?;

        let stored = match self.options.locking {
            LockingMode::Optimistic => self
                .target
                .upsert(&key.type_name, &id, &id, body)
                .await
                .map_err(|source| write_error(key, source))?,
            LockingMode::Pessimistic => {
                let _guard = self.locks.acquire(&id, self.options.lock_timeout).await?;
                if let Some(existing) = self.read_target(key, &id).await? {
                    debug!(target: "saga_migrator", event = "adapter_create_existing", key = %key, id = %id);
                    return Ok(CreateOutcome::Existing(existing));
                }
                self.target
                    .create(&key.type_name, &id, &id, body)
                    .await
                    .map_err(|source| match source {
                        StoreError::Conflict { .. } => PersistenceError::Concurrency {
                            key: key.to_string(),
                            reason: "document appeared while the key was locked".into(),
                        },
                        other => write_error(key, other),
                    })?
            }
        };

        info!(target: "saga_migrator", event = "adapter_created", key = %key, id = %id);
        record.origin = RecordOrigin::Created { etag: stored.etag };
        Ok(CreateOutcome::Created(record))
    }

    /// Persists `record.state`. Target records are replaced only if unchanged
    /// since they were read; legacy records are created in the target.
    pub async fn save(&self, record: &mut SagaRecord) -> Result<(), PersistenceError> {
        let key = record.key.clone();
        let id = key.document_id();
        if record.id != id {
            return Err(PersistenceError::Configuration(format!(
                "record id {} does not belong to key {key}",
                record.id
            )));
        }
        let body = encode(record)?;

        let _guard = match self.options.locking {
            LockingMode::Pessimistic => Some(self.locks.acquire(&id, self.options.lock_timeout).await?),
            LockingMode::Optimistic => None,
        };

        let stored = match &record.origin {
            RecordOrigin::Target { etag } | RecordOrigin::Created { etag } => self
                .target
                .replace(&key.type_name, &id, &id, body, etag)
                .await
                .map_err(|source| match source {
                    StoreError::PreconditionFailed { .. } => PersistenceError::Concurrency {
                        key: key.to_string(),
                        reason: "document changed since it was read".into(),
                    },
                    StoreError::NotFound { .. } => PersistenceError::Concurrency {
                        key: key.to_string(),
                        reason: "document was removed since it was read".into(),
                    },
                    other => write_error(&key, other),
                })?,
            RecordOrigin::Source {
                partition_key,
                row_key,
            } => {
                if self.options.locking == LockingMode::Pessimistic
                    && self.read_target(&key, &id).await?.is_some()
                {
                    return Err(reconciliation_gap(&key, partition_key, row_key));
                }
                match self.target.create(&key.type_name, &id, &id, body).await {
                    Ok(stored) => stored,
                    Err(StoreError::Conflict { .. }) => {
                        let current = self.read_target(&key, &id).await?;
                        return Err(match current {
                            Some(_) => reconciliation_gap(&key, partition_key, row_key),
                            None => PersistenceError::Concurrency {
                                key: key.to_string(),
                                reason: "target document appeared during save".into(),
                            },
                        });
                    }
                    Err(other) => return Err(write_error(&key, other)),
                }
            }
        };

        debug!(target: "saga_migrator", event = "adapter_saved", key = %key, id = %id);
        record.origin = RecordOrigin::Target { etag: stored.etag };
        Ok(())
    }

    async fn read_target(
        &self,
        key: &SagaKey,
        id: &str,
    ) -> Result<Option<SagaRecord>, PersistenceError> {
        let stored = self
            .target
            .read(&key.type_name, id, id)
            .await
            .map_err(|source| PersistenceError::Lookup {
                key: key.to_string(),
                source,
            })?;
        let Some(stored) = stored else {
            return Ok(None);
        };

        let corrupt = |reason: String| PersistenceError::CorruptDocument {
            key: key.to_string(),
            reason,
        };
        let document =
            TargetDocument::from_json_bytes(&stored.body).map_err(|err| corrupt(err.to_string()))?;
        if document.id != id || document.partition_key != id {
            return Err(corrupt(format!(
                "document carries id {} and partition key {}",
                document.id, document.partition_key
            )));
        }

        Ok(Some(SagaRecord {
            key: key.clone(),
            id: id.to_string(),
            state: SagaState {
                data: document.data,
                types: document.types,
            },
            origin: RecordOrigin::Target { etag: stored.etag },
        }))
    }

    async fn read_source(
        &self,
        key: &SagaKey,
        id: &str,
    ) -> Result<Option<SagaRecord>, PersistenceError> {
        let source = self.source.as_ref().ok_or_else(|| {
            PersistenceError::Configuration("migration mode is on but no source store".into())
        })?;
        let row = source
            .find_by_property(
                &key.type_name,
                &key.property,
                &key.value,
                self.options.source_page_size,
            )
            .await
            .map_err(|source| PersistenceError::Lookup {
                key: key.to_string(),
                source,
            })?;
        let Some(row) = row else {
            return Ok(None);
        };

        let mapped = self.mapper.map(&key.type_name, id, &row);
        if let Some(first) = mapped.field_errors.first() {
            if self.mapper.options().field_error_policy == FieldErrorPolicy::FailRecord {
                return Err(PersistenceError::Mapping {
                    key: key.to_string(),
                    source: first.clone(),
                });
            }
            for err in &mapped.field_errors {
                warn!(
                    target: "saga_migrator",
                    event = "adapter_field_skipped",
                    key = %key,
                    field = err.field(),
                    reason = %err,
                );
            }
        }

        let (partition_key, row_key) = row.row_identity();
        debug!(
            target: "saga_migrator",
            event = "adapter_source_hit",
            key = %key,
            partition_key = %partition_key,
            row_key = %row_key,
        );
        Ok(Some(SagaRecord {
            key: key.clone(),
            id: id.to_string(),
            state: SagaState {
                data: mapped.document.data,
                types: mapped.document.types,
            },
            origin: RecordOrigin::Source {
                partition_key,
                row_key,
            },
        }))
    }
}

fn encode(record: &SagaRecord) -> Result<Vec<u8>, PersistenceError> {
    record
        .state
        .validate()
        .map_err(|source| PersistenceError::InvalidState {
            key: record.key.to_string(),
            source,
        })?;
    record
        .to_document()
        .to_json_bytes()
        .map_err(|err| PersistenceError::CorruptDocument {
            key: record.key.to_string(),
            reason: err.to_string(),
        })
}

fn write_error(key: &SagaKey, source: StoreError) -> PersistenceError {
    PersistenceError::Write {
        key: key.to_string(),
        source,
    }
}

/// The target already holds this key while the caller works from the legacy
/// row. The target copy stands; nothing is merged.
fn reconciliation_gap(key: &SagaKey, partition_key: &str, row_key: &str) -> PersistenceError {
    warn!(
        target: "saga_migrator",
        event = "reconciliation_gap",
        key = %key,
        partition_key,
        row_key,
    );
    PersistenceError::Concurrency {
        key: key.to_string(),
        reason: "target already holds this saga; legacy copy not written".into(),
    }
}
